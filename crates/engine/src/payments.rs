//! Payment allocation.
//!
//! Applies a payment to a unit's outstanding fees strictly oldest-first.
//! Settlement never skips ahead: a later period is not touched while an
//! earlier one still carries a balance, no matter which fee the payment
//! was nominally for. Surplus beyond all outstanding fees is held as unit
//! credit, never discarded.
//!
//! The planning step is a pure function over the fetched balances; the
//! service wraps it in a transaction that locks the unit row, so
//! allocations for one unit serialize.

use condoledger_shared::{FeeStatus, Period};
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{DomainEventBuilder, DomainEventLogger, DomainEventType};

/// An unpaid fee with its already-allocated total, ordered oldest-first.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutstandingFee {
    pub id: Uuid,
    pub year: i32,
    pub month: Option<i32>,
    pub amount: Decimal,
    pub paid: Decimal,
}

impl OutstandingFee {
    pub fn outstanding(&self) -> Decimal {
        (self.amount - self.paid).max(Decimal::ZERO)
    }

    /// Billing period of this fee; annual fees sort after the months of
    /// their year, matching the fetch order.
    pub fn period(&self) -> Period {
        Period {
            year: self.year,
            month: self.month.map(|m| m as u8),
        }
    }
}

/// One slice of a payment applied to one fee.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PlannedAllocation {
    pub fee_id: Uuid,
    pub amount: Decimal,
    /// Whether this slice brings the fee's outstanding balance to zero.
    pub settles: bool,
}

/// Walk the fees in the given order, covering each outstanding balance in
/// full before moving to the next. Returns the allocations and the
/// unallocated remainder.
pub fn plan_allocation(
    fees: &[OutstandingFee],
    amount: Decimal,
) -> (Vec<PlannedAllocation>, Decimal) {
    let mut remaining = amount;
    let mut allocations = Vec::new();
    for fee in fees {
        if remaining <= Decimal::ZERO {
            break;
        }
        let outstanding = fee.outstanding();
        if outstanding <= Decimal::ZERO {
            continue;
        }
        let slice = remaining.min(outstanding);
        allocations.push(PlannedAllocation {
            fee_id: fee.id,
            amount: slice,
            settles: slice == outstanding,
        });
        remaining -= slice;
    }
    (allocations, remaining)
}

/// Outcome of applying one payment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AllocationResult {
    pub payment_id: Uuid,
    pub unit_id: Uuid,
    pub allocations: Vec<PlannedAllocation>,
    /// Surplus held as unit credit for future periods.
    pub credit_remainder: Decimal,
}

#[derive(Clone)]
pub struct PaymentAllocationService {
    pool: PgPool,
    events: DomainEventLogger,
}

impl PaymentAllocationService {
    pub fn new(pool: PgPool) -> Self {
        let events = DomainEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Apply a payment to a unit's outstanding fees, oldest period first.
    pub async fn apply(
        &self,
        unit_id: Uuid,
        amount: Decimal,
        applied_at: OffsetDateTime,
    ) -> EngineResult<AllocationResult> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::NonPositiveAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        // Serializes allocations per unit.
        let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM units WHERE id = $1 FOR UPDATE")
            .bind(unit_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(EngineError::NotFound(format!("unit {unit_id}")));
        }

        let fees: Vec<OutstandingFee> = sqlx::query_as(
            r#"
            SELECT f.id, f.year, f.month, f.amount, COALESCE(SUM(fp.amount), 0) AS paid
            FROM fees f
            LEFT JOIN fee_payments fp ON fp.fee_id = f.id
            WHERE f.unit_id = $1 AND f.status <> 'paid' AND NOT f.is_historical
            GROUP BY f.id
            ORDER BY f.year ASC, f.month ASC NULLS LAST, f.due_date ASC
            "#,
        )
        .bind(unit_id)
        .fetch_all(&mut *tx)
        .await?;

        let (allocations, credit_remainder) = plan_allocation(&fees, amount);

        let payment_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO payments (id, unit_id, amount, applied_at, credit_remainder)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(payment_id)
        .bind(unit_id)
        .bind(amount)
        .bind(applied_at)
        .bind(credit_remainder)
        .execute(&mut *tx)
        .await?;

        for allocation in &allocations {
            sqlx::query(
                "INSERT INTO fee_payments (payment_id, fee_id, amount) VALUES ($1, $2, $3)",
            )
            .bind(payment_id)
            .bind(allocation.fee_id)
            .bind(allocation.amount)
            .execute(&mut *tx)
            .await?;

            if allocation.settles {
                sqlx::query("UPDATE fees SET status = $1 WHERE id = $2")
                    .bind(FeeStatus::Paid.as_str())
                    .bind(allocation.fee_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            unit_id = %unit_id,
            payment_id = %payment_id,
            amount = %amount,
            fees_touched = allocations.len(),
            credit_remainder = %credit_remainder,
            "Payment allocated"
        );

        for allocation in allocations.iter().filter(|a| a.settles) {
            if let Err(e) = self
                .events
                .log(
                    DomainEventBuilder::new(DomainEventType::FeePaid)
                        .unit(unit_id)
                        .payload(serde_json::json!({
                            "fee_id": allocation.fee_id,
                            "payment_id": payment_id,
                            "amount": allocation.amount,
                        })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log fee paid event");
            }
        }

        Ok(AllocationResult {
            payment_id,
            unit_id,
            allocations,
            credit_remainder,
        })
    }

    /// Current outstanding balance of a unit over its non-historical fees.
    pub async fn get_outstanding_balance(&self, unit_id: Uuid) -> EngineResult<Decimal> {
        let balance: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE((
                SELECT SUM(amount) FROM fees
                WHERE unit_id = $1 AND NOT is_historical
            ), 0)
            - COALESCE((
                SELECT SUM(fp.amount)
                FROM fee_payments fp
                JOIN fees f ON f.id = fp.fee_id
                WHERE f.unit_id = $1 AND NOT f.is_historical
            ), 0)
            "#,
        )
        .bind(unit_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fee(year: i32, month: Option<i32>, amount: Decimal, paid: Decimal) -> OutstandingFee {
        OutstandingFee {
            id: Uuid::new_v4(),
            year,
            month,
            amount,
            paid,
        }
    }

    #[test]
    fn oldest_fee_settles_first() {
        // Two periods of 50.00 each; 50.00 settles the older one only.
        let fees = vec![
            fee(2024, Some(1), dec!(50.00), Decimal::ZERO),
            fee(2024, Some(2), dec!(50.00), Decimal::ZERO),
        ];
        let (allocations, remainder) = plan_allocation(&fees, dec!(50.00));

        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].fee_id, fees[0].id);
        assert_eq!(allocations[0].amount, dec!(50.00));
        assert!(allocations[0].settles);
        assert_eq!(remainder, Decimal::ZERO);
    }

    #[test]
    fn never_skips_to_a_smaller_later_fee() {
        // The later fee is small enough to settle outright, but the
        // older debt still absorbs the payment first.
        let fees = vec![
            fee(2024, Some(1), dec!(80.00), Decimal::ZERO),
            fee(2024, Some(2), dec!(10.00), Decimal::ZERO),
        ];
        let (allocations, remainder) = plan_allocation(&fees, dec!(10.00));

        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].fee_id, fees[0].id);
        assert!(!allocations[0].settles);
        assert_eq!(remainder, Decimal::ZERO);
    }

    #[test]
    fn partial_payments_accumulate_to_settlement() {
        let f = fee(2024, Some(1), dec!(50.00), dec!(30.00));
        let (allocations, _) = plan_allocation(&[f.clone()], dec!(20.00));
        assert_eq!(allocations[0].amount, dec!(20.00));
        assert!(allocations[0].settles);
    }

    #[test]
    fn surplus_becomes_credit() {
        let fees = vec![fee(2024, Some(1), dec!(50.00), Decimal::ZERO)];
        let (allocations, remainder) = plan_allocation(&fees, dec!(70.00));
        assert_eq!(allocations.len(), 1);
        assert!(allocations[0].settles);
        assert_eq!(remainder, dec!(20.00));
    }

    #[test]
    fn payment_spans_multiple_periods_in_order() {
        let fees = vec![
            fee(2023, Some(11), dec!(40.00), Decimal::ZERO),
            fee(2023, Some(12), dec!(40.00), Decimal::ZERO),
            fee(2024, Some(1), dec!(40.00), Decimal::ZERO),
        ];
        let (allocations, remainder) = plan_allocation(&fees, dec!(100.00));

        assert_eq!(allocations.len(), 3);
        assert!(allocations[0].settles);
        assert!(allocations[1].settles);
        assert_eq!(allocations[2].amount, dec!(20.00));
        assert!(!allocations[2].settles);
        assert_eq!(remainder, Decimal::ZERO);
    }

    #[test]
    fn already_covered_fees_are_passed_over() {
        let fees = vec![
            fee(2024, Some(1), dec!(50.00), dec!(50.00)),
            fee(2024, Some(2), dec!(50.00), Decimal::ZERO),
        ];
        let (allocations, _) = plan_allocation(&fees, dec!(25.00));
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].fee_id, fees[1].id);
    }

    #[test]
    fn balance_identity_holds_over_any_sequence() {
        // Simulate fees plus a series of payments through the planner and
        // check Σ(fees) − Σ(allocated) always matches the running
        // outstanding total.
        let mut fees = vec![
            fee(2024, Some(1), dec!(30.00), Decimal::ZERO),
            fee(2024, Some(2), dec!(45.50), Decimal::ZERO),
            fee(2024, None, dec!(120.00), Decimal::ZERO),
        ];
        let total: Decimal = fees.iter().map(|f| f.amount).sum();
        let mut allocated = Decimal::ZERO;

        for payment in [dec!(25.00), dec!(50.00), dec!(10.25)] {
            let (allocations, _) = plan_allocation(&fees, payment);
            for a in &allocations {
                allocated += a.amount;
                let target = fees.iter_mut().find(|f| f.id == a.fee_id).unwrap();
                target.paid += a.amount;
            }
        }

        let outstanding: Decimal = fees.iter().map(|f| f.outstanding()).sum();
        assert_eq!(outstanding, total - allocated);
        assert_eq!(allocated, dec!(85.25));
    }
}
