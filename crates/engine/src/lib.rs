// Engine crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Fee generation keys carry many components
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CondoLedger Accounting Engine
//!
//! License-based subscription tracking and fee accounting for
//! condominium-management tenants.
//!
//! ## Features
//!
//! - **License Usage**: count billable units across attached tenants
//! - **Tiered Pricing**: flat per-tier price resolution with a minimum floor
//! - **Subscription Ledger**: attach/detach tenants, capacity policy,
//!   transactional recalculation of the usage cache
//! - **Fee Generation**: per-unit periodic fees from approved budgets,
//!   idempotent per period
//! - **Payment Allocation**: oldest-first settlement with a per-unit
//!   allocation trail and credit carry-over
//! - **Invariants**: runnable consistency checks with optional repair
//! - **Events & Audit**: append-only domain events and mutation audit trail

pub mod audit;
pub mod budget;
pub mod error;
pub mod events;
pub mod fees;
pub mod invariants;
pub mod ledger;
pub mod payments;
pub mod plan;
pub mod pricing;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Budget
pub use budget::{ApprovedBudget, BudgetService};

// Error
pub use error::{EngineError, EngineResult};

// Events
pub use events::{ActorType, DomainEventBuilder, DomainEventLogger, DomainEventType};

// Fees
pub use fees::{
    distribute_by_weight, fee_reference, FeeGenerationService, FeeOutcome, GeneratedFee,
    GenerationReport,
};

// Invariants
pub use invariants::{
    FixSummary, InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{Subscription, SubscriptionLedger, UsagePreview, EXPIRED_LOCK_REASON};

// Payments
pub use payments::{
    plan_allocation, AllocationResult, OutstandingFee, PaymentAllocationService,
    PlannedAllocation,
};

// Plan
pub use plan::{Plan, PlanService, PricingTier};

// Pricing
pub use pricing::{compute_monthly_charge, effective_units, resolve_tier_price};

// Usage
pub use usage::LicenseUsageService;

use sqlx::PgPool;

/// Main engine facade combining every accounting service.
pub struct AccountingEngine {
    pub plans: PlanService,
    pub usage: LicenseUsageService,
    pub ledger: SubscriptionLedger,
    pub fees: FeeGenerationService,
    pub payments: PaymentAllocationService,
    pub budget: BudgetService,
    pub invariants: InvariantChecker,
    pub events: DomainEventLogger,
}

impl AccountingEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            plans: PlanService::new(pool.clone()),
            usage: LicenseUsageService::new(pool.clone()),
            ledger: SubscriptionLedger::new(pool.clone()),
            fees: FeeGenerationService::new(pool.clone()),
            payments: PaymentAllocationService::new(pool.clone()),
            budget: BudgetService::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            events: DomainEventLogger::new(pool),
        }
    }
}
