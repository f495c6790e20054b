// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain types for the CondoLedger workspace.

pub mod types;

pub use types::{
    AttachmentStatus, FeeKind, FeeStatus, Period, PlanCapacity, SubscriptionStatus, TenantAccess,
};
