//! Plan loading and pricing-tier configuration.
//!
//! Plans are seeded and administered out of band; the engine treats them as
//! read-only. The string `plan_type` column is decoded into the closed
//! [`PlanCapacity`] variant at load time so every capacity decision is an
//! exhaustive match, and a malformed plan row fails loudly as an integrity
//! error instead of silently misbilling.

use condoledger_shared::PlanCapacity;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// One contiguous license-count range billed at a flat per-license price.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PricingTier {
    pub min_units: i64,
    /// `None` marks the unbounded top tier.
    pub max_units: Option<i64>,
    pub price_per_unit: Decimal,
}

impl PricingTier {
    pub fn covers(&self, unit_count: i64) -> bool {
        unit_count >= self.min_units && self.max_units.is_none_or(|max| unit_count <= max)
    }
}

/// A billing plan with its decoded capacity policy and ordered tier table.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub capacity: PlanCapacity,
    /// Minimum billable units, always charged when the subscription keeps
    /// `charge_minimum` set.
    pub license_min: i64,
    pub allow_overage: bool,
    /// Ordered by `min_units`; validated gap-free over `[license_min, ∞)`.
    pub tiers: Vec<PricingTier>,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    plan_type: String,
    license_min: i32,
    license_limit_default: Option<i32>,
    allow_overage: bool,
}

/// Verify the tier table is non-overlapping and gap-free from
/// `license_min` up to an unbounded top tier. Run on load so a
/// configuration defect surfaces before any charge is computed.
pub fn validate_tiers(tiers: &[PricingTier], license_min: i64) -> EngineResult<()> {
    if tiers.is_empty() {
        return Err(EngineError::Integrity(
            "plan has no pricing tiers".to_string(),
        ));
    }
    let mut expected_min = license_min.min(tiers[0].min_units);
    for (idx, tier) in tiers.iter().enumerate() {
        if tier.min_units != expected_min {
            return Err(EngineError::Integrity(format!(
                "pricing tier {idx} starts at {} but {} was expected",
                tier.min_units, expected_min
            )));
        }
        match tier.max_units {
            Some(max) if max < tier.min_units => {
                return Err(EngineError::Integrity(format!(
                    "pricing tier {idx} has max {max} below min {}",
                    tier.min_units
                )));
            }
            Some(max) => expected_min = max + 1,
            None => {
                if idx != tiers.len() - 1 {
                    return Err(EngineError::Integrity(format!(
                        "unbounded pricing tier {idx} is not the last tier"
                    )));
                }
            }
        }
    }
    if tiers[tiers.len() - 1].max_units.is_some() {
        return Err(EngineError::Integrity(
            "last pricing tier must be unbounded".to_string(),
        ));
    }
    Ok(())
}

/// Load a plan and its tier table on the caller's connection, so a ledger
/// transaction reads the same plan it acts on.
pub async fn load_plan(conn: &mut PgConnection, plan_id: Uuid) -> EngineResult<Plan> {
    let row: PlanRow = sqlx::query_as(
        "SELECT id, name, plan_type, license_min, license_limit_default, allow_overage
         FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("plan {plan_id}")))?;

    let capacity = PlanCapacity::decode(&row.plan_type, row.license_limit_default.map(i64::from))
        .map_err(|reason| EngineError::Integrity(format!("plan {plan_id}: {reason}")))?;

    let tiers: Vec<PricingTier> = sqlx::query_as(
        "SELECT min_units, max_units, price_per_unit
         FROM pricing_tiers WHERE plan_id = $1 ORDER BY min_units",
    )
    .bind(plan_id)
    .fetch_all(&mut *conn)
    .await?;

    let license_min = i64::from(row.license_min);
    validate_tiers(&tiers, license_min)?;

    Ok(Plan {
        id: row.id,
        name: row.name,
        capacity,
        license_min,
        allow_overage: row.allow_overage,
        tiers,
    })
}

/// Read-only plan access for callers outside a ledger transaction.
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, plan_id: Uuid) -> EngineResult<Plan> {
        let mut conn = self.pool.acquire().await?;
        load_plan(&mut conn, plan_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tier(min: i64, max: Option<i64>, price: Decimal) -> PricingTier {
        PricingTier {
            min_units: min,
            max_units: max,
            price_per_unit: price,
        }
    }

    #[test]
    fn contiguous_tiers_validate() {
        let tiers = vec![
            tier(0, Some(10), dec!(9.00)),
            tier(11, Some(50), dec!(7.50)),
            tier(51, None, dec!(6.00)),
        ];
        assert!(validate_tiers(&tiers, 0).is_ok());
    }

    #[test]
    fn gap_between_tiers_is_rejected() {
        let tiers = vec![tier(0, Some(10), dec!(9.00)), tier(12, None, dec!(7.50))];
        assert!(matches!(
            validate_tiers(&tiers, 0),
            Err(EngineError::Integrity(_))
        ));
    }

    #[test]
    fn overlapping_tiers_are_rejected() {
        let tiers = vec![tier(0, Some(10), dec!(9.00)), tier(10, None, dec!(7.50))];
        assert!(validate_tiers(&tiers, 0).is_err());
    }

    #[test]
    fn bounded_last_tier_is_rejected() {
        let tiers = vec![tier(0, Some(10), dec!(9.00))];
        assert!(validate_tiers(&tiers, 0).is_err());
    }

    #[test]
    fn empty_tier_table_is_rejected() {
        assert!(validate_tiers(&[], 0).is_err());
    }

    #[test]
    fn tier_coverage_is_inclusive_on_both_ends() {
        let t = tier(11, Some(50), dec!(7.50));
        assert!(t.covers(11));
        assert!(t.covers(50));
        assert!(!t.covers(10));
        assert!(!t.covers(51));

        let top = tier(51, None, dec!(6.00));
        assert!(top.covers(51));
        assert!(top.covers(1_000_000));
    }
}
