//! Accounting invariants.
//!
//! Runnable consistency checks over the persisted state, intended for the
//! periodic verification job and for ad hoc runs after data repair.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read; fixes are a separate,
//!    explicitly requested step
//! 4. **Single writer**: the fix path routes `used_licenses` repairs
//!    through the ledger's recalculation, never patches the cache itself

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::ledger::SubscriptionLedger;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Rows affected (subscription, tenant, fee or plan ids)
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: String,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Outcome of an explicitly requested fix pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixSummary {
    pub fixed: usize,
    pub unfixable: usize,
    pub details: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MultiAttachRow {
    tenant_id: Uuid,
    attachment_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleUsageRow {
    subscription_id: Uuid,
    used_licenses: i32,
    expected: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnlockedTenantRow {
    tenant_id: Uuid,
    access_state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MisallocatedFeeRow {
    fee_id: Uuid,
    unit_id: Uuid,
    amount: Decimal,
    allocated: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct FifoBreachRow {
    later_fee_id: Uuid,
    earlier_fee_id: Uuid,
    unit_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UncappedPlanRow {
    plan_id: Uuid,
    name: String,
}

/// Expected usage expression shared by the check and the fix queries.
const EXPECTED_USAGE_SQL: &str = r#"
    SELECT s.id AS subscription_id, s.used_licenses,
           GREATEST(
               CASE WHEN s.charge_minimum THEN p.license_min ELSE 0 END,
               COALESCE(b.billable, 0)
           )::BIGINT AS expected
    FROM subscriptions s
    JOIN plans p ON p.id = s.plan_id
    LEFT JOIN (
        SELECT ta.subscription_id, COUNT(u.id) AS billable
        FROM tenant_attachments ta
        JOIN units u ON u.tenant_id = ta.tenant_id
        WHERE ta.status = 'active'
          AND u.is_active AND u.license_consumed AND u.archived_at IS NULL
        GROUP BY ta.subscription_id
    ) b ON b.subscription_id = s.id
    WHERE s.status IN ('trial', 'active', 'suspended')
"#;

/// Service for running accounting invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> EngineResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_attachment().await?);
        violations.extend(self.check_used_licenses_matches_aggregate().await?);
        violations.extend(self.check_detached_tenant_locked().await?);
        violations.extend(self.check_fee_not_overallocated().await?);
        violations.extend(self.check_paid_fee_fully_allocated().await?);
        violations.extend(self.check_fifo_settlement_order().await?);
        violations.extend(self.check_capped_plan_has_limit().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now.to_string(),
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one active attachment per tenant
    ///
    /// Two live attachments would double-count the tenant's units against
    /// two subscriptions.
    async fn check_single_active_attachment(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiAttachRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) AS attachment_count
            FROM tenant_attachments
            WHERE status = 'active'
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_attachment".to_string(),
                subject_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} active attachments (expected at most 1)",
                    row.attachment_count
                ),
                context: serde_json::json!({
                    "attachment_count": row.attachment_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: the cached usage counter equals the floored aggregate
    ///
    /// A stale cache bills the wrong number of licenses.
    async fn check_used_licenses_matches_aggregate(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let query = format!(
            "SELECT * FROM ({EXPECTED_USAGE_SQL}) AS derived WHERE used_licenses <> expected"
        );
        let rows: Vec<StaleUsageRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "used_licenses_matches_aggregate".to_string(),
                subject_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription caches {} used licenses but {} are derivable",
                    row.used_licenses, row.expected
                ),
                context: serde_json::json!({
                    "cached": row.used_licenses,
                    "expected": row.expected,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: a tenant without a live attachment must not be active
    async fn check_detached_tenant_locked(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<UnlockedTenantRow> = sqlx::query_as(
            r#"
            SELECT t.id AS tenant_id, t.access_state
            FROM tenants t
            WHERE t.access_state = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM tenant_attachments ta
                  WHERE ta.tenant_id = t.id AND ta.status = 'active'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "detached_tenant_locked".to_string(),
                subject_ids: vec![row.tenant_id],
                description: "Tenant has no active attachment but is not locked".to_string(),
                context: serde_json::json!({
                    "access_state": row.access_state,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: allocations never exceed the fee amount
    async fn check_fee_not_overallocated(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<MisallocatedFeeRow> = sqlx::query_as(
            r#"
            SELECT f.id AS fee_id, f.unit_id, f.amount, SUM(fp.amount) AS allocated
            FROM fees f
            JOIN fee_payments fp ON fp.fee_id = f.id
            GROUP BY f.id
            HAVING SUM(fp.amount) > f.amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "fee_not_overallocated".to_string(),
                subject_ids: vec![row.fee_id],
                description: format!(
                    "Fee of {} carries {} in allocations",
                    row.amount, row.allocated
                ),
                context: serde_json::json!({
                    "unit_id": row.unit_id,
                    "amount": row.amount,
                    "allocated": row.allocated,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: a fee marked paid is fully allocated
    async fn check_paid_fee_fully_allocated(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<MisallocatedFeeRow> = sqlx::query_as(
            r#"
            SELECT f.id AS fee_id, f.unit_id, f.amount,
                   COALESCE(SUM(fp.amount), 0) AS allocated
            FROM fees f
            LEFT JOIN fee_payments fp ON fp.fee_id = f.id
            WHERE f.status = 'paid'
            GROUP BY f.id
            HAVING COALESCE(SUM(fp.amount), 0) <> f.amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_fee_fully_allocated".to_string(),
                subject_ids: vec![row.fee_id],
                description: format!(
                    "Paid fee of {} has only {} allocated",
                    row.amount, row.allocated
                ),
                context: serde_json::json!({
                    "unit_id": row.unit_id,
                    "amount": row.amount,
                    "allocated": row.allocated,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: no later period settles while an earlier one is open
    ///
    /// Settlement is strictly oldest-first per unit; annual fees sort
    /// after the months of their year.
    async fn check_fifo_settlement_order(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<FifoBreachRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT later.id AS later_fee_id,
                   earlier.id AS earlier_fee_id,
                   later.unit_id
            FROM fees later
            JOIN fees earlier ON earlier.unit_id = later.unit_id
            WHERE later.status = 'paid'
              AND earlier.status <> 'paid'
              AND NOT later.is_historical
              AND NOT earlier.is_historical
              AND (earlier.year, COALESCE(earlier.month, 13))
                < (later.year, COALESCE(later.month, 13))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "fifo_settlement_order".to_string(),
                subject_ids: vec![row.later_fee_id, row.earlier_fee_id],
                description: "A later fee is paid while an earlier period is still open"
                    .to_string(),
                context: serde_json::json!({
                    "unit_id": row.unit_id,
                    "paid_fee_id": row.later_fee_id,
                    "open_fee_id": row.earlier_fee_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 7: capped plans actually carry a limit
    async fn check_capped_plan_has_limit(&self) -> EngineResult<Vec<InvariantViolation>> {
        let rows: Vec<UncappedPlanRow> = sqlx::query_as(
            r#"
            SELECT id AS plan_id, name
            FROM plans
            WHERE plan_type = 'multi_tenant_capped' AND license_limit_default IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "capped_plan_has_limit".to_string(),
                subject_ids: vec![row.plan_id],
                description: format!("Capped plan '{}' has no license limit", row.name),
                context: serde_json::json!({
                    "plan_name": row.name,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> EngineResult<Vec<InvariantViolation>> {
        match name {
            "single_active_attachment" => self.check_single_active_attachment().await,
            "used_licenses_matches_aggregate" => {
                self.check_used_licenses_matches_aggregate().await
            }
            "detached_tenant_locked" => self.check_detached_tenant_locked().await,
            "fee_not_overallocated" => self.check_fee_not_overallocated().await,
            "paid_fee_fully_allocated" => self.check_paid_fee_fully_allocated().await,
            "fifo_settlement_order" => self.check_fifo_settlement_order().await,
            "capped_plan_has_limit" => self.check_capped_plan_has_limit().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_attachment",
            "used_licenses_matches_aggregate",
            "detached_tenant_locked",
            "fee_not_overallocated",
            "paid_fee_fully_allocated",
            "fifo_settlement_order",
            "capped_plan_has_limit",
        ]
    }

    /// Apply fixes for the violations that have a safe correction.
    ///
    /// Stale usage caches are recomputed through the ledger so the cache
    /// keeps its single writer; unlocked detached tenants are locked.
    /// Money inconsistencies are never auto-corrected.
    pub async fn fix_violations(
        &self,
        ledger: &SubscriptionLedger,
        violations: &[InvariantViolation],
    ) -> EngineResult<FixSummary> {
        let mut summary = FixSummary::default();

        for violation in violations {
            match violation.invariant.as_str() {
                "used_licenses_matches_aggregate" => {
                    for &subscription_id in &violation.subject_ids {
                        let used = ledger.recalculate(subscription_id).await?;
                        summary.fixed += 1;
                        summary.details.push(format!(
                            "recalculated subscription {subscription_id}: used_licenses = {used}"
                        ));
                    }
                }
                "detached_tenant_locked" => {
                    for &tenant_id in &violation.subject_ids {
                        let locked = sqlx::query(
                            r#"
                            UPDATE tenants
                            SET access_state = 'locked', locked_at = NOW(),
                                locked_reason = 'no active subscription attachment'
                            WHERE id = $1
                              AND access_state = 'active'
                              AND NOT EXISTS (
                                  SELECT 1 FROM tenant_attachments ta
                                  WHERE ta.tenant_id = $1 AND ta.status = 'active'
                              )
                            "#,
                        )
                        .bind(tenant_id)
                        .execute(&self.pool)
                        .await?
                        .rows_affected();
                        if locked > 0 {
                            summary.fixed += 1;
                            summary.details.push(format!("locked tenant {tenant_id}"));
                        }
                    }
                }
                other => {
                    summary.unfixable += 1;
                    summary
                        .details
                        .push(format!("{other}: no automatic fix, manual repair required"));
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_active_attachment"));
        assert!(checks.contains(&"fifo_settlement_order"));
    }
}
