//! Engine error taxonomy.
//!
//! Business-rule rejections (`Validation`, `CapacityExceeded`,
//! `SingleTenantViolation`) are returned before any write and must not be
//! retried. `ConcurrencyConflict` is the only retryable variant; bounded
//! retries with backoff are the caller's job, never the engine's.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, caught before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Attaching would exceed the effective license limit and the plan
    /// does not allow overage. Carries the numbers for diagnostics.
    #[error("license capacity exceeded: prospective usage {prospective} over limit {limit}")]
    CapacityExceeded { prospective: i64, limit: i64 },

    #[error("single-tenant plan already has an attached tenant")]
    SingleTenantViolation,

    #[error("not found: {0}")]
    NotFound(String),

    /// Lock contention or stale state detected mid-transaction.
    #[error("concurrent modification: {0}")]
    ConcurrencyConflict(String),

    /// Persisted state violates an invariant.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Pricing configuration gap. Fatal and internal, never user-facing.
    #[error("no pricing tier covers a count of {unit_count} units")]
    TierNotFound { unit_count: i64 },

    /// The fee generator requires an approved annual budget.
    #[error("no approved budget for tenant {tenant_id} in {year}")]
    BudgetNotApproved { tenant_id: Uuid, year: i32 },

    #[error("payment amount {0} must be positive")]
    NonPositiveAmount(Decimal),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl EngineError {
    /// Whether a caller may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                return match code.as_ref() {
                    // lock_not_available, serialization_failure, deadlock_detected
                    "55P03" | "40001" | "40P01" => {
                        Self::ConcurrencyConflict(db.message().to_string())
                    }
                    // unique_violation, foreign_key_violation, check_violation
                    "23505" | "23503" | "23514" => Self::Integrity(db.message().to_string()),
                    _ => Self::Database(err),
                };
            }
        }
        Self::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_conflicts_are_retryable() {
        assert!(EngineError::ConcurrencyConflict("lock timeout".into()).is_retryable());
        assert!(!EngineError::Validation("bad month".into()).is_retryable());
        assert!(!EngineError::CapacityExceeded {
            prospective: 70,
            limit: 60
        }
        .is_retryable());
        assert!(!EngineError::TierNotFound { unit_count: 3 }.is_retryable());
    }

    #[test]
    fn capacity_error_carries_diagnostics() {
        let err = EngineError::CapacityExceeded {
            prospective: 70,
            limit: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("70"));
        assert!(msg.contains("60"));
    }
}
