//! Tiered price resolution.
//!
//! Pure functions over a plan's tier table. The whole unit count is billed
//! at the single covering tier's flat rate; there is no graduated pricing.

use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::plan::{Plan, PricingTier};

/// Find the per-unit price of the tier covering `unit_count`.
///
/// A missing tier is a configuration defect surfaced as
/// [`EngineError::TierNotFound`]; it is never a user-facing condition.
pub fn resolve_tier_price(tiers: &[PricingTier], unit_count: i64) -> EngineResult<Decimal> {
    tiers
        .iter()
        .find(|tier| tier.covers(unit_count))
        .map(|tier| tier.price_per_unit)
        .ok_or(EngineError::TierNotFound { unit_count })
}

/// Units actually billed: the minimum floor applies while the
/// subscription keeps `charge_minimum` set.
pub fn effective_units(license_min: i64, charge_minimum: bool, used: i64) -> i64 {
    if charge_minimum {
        license_min.max(used)
    } else {
        used.max(0)
    }
}

/// Monthly charge for a subscription on this plan.
pub fn compute_monthly_charge(
    plan: &Plan,
    used_licenses: i64,
    charge_minimum: bool,
) -> EngineResult<Decimal> {
    let units = effective_units(plan.license_min, charge_minimum, used_licenses);
    let price = resolve_tier_price(&plan.tiers, units)?;
    Ok(price * Decimal::from(units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use condoledger_shared::PlanCapacity;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn plan_with_tiers(license_min: i64, tiers: Vec<PricingTier>) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            capacity: PlanCapacity::MultiTenantUncapped,
            license_min,
            allow_overage: false,
            tiers,
        }
    }

    fn tiers() -> Vec<PricingTier> {
        vec![
            PricingTier {
                min_units: 0,
                max_units: Some(10),
                price_per_unit: dec!(9.00),
            },
            PricingTier {
                min_units: 11,
                max_units: Some(50),
                price_per_unit: dec!(7.50),
            },
            PricingTier {
                min_units: 51,
                max_units: None,
                price_per_unit: dec!(6.00),
            },
        ]
    }

    #[test]
    fn resolves_the_single_covering_tier() {
        let tiers = tiers();
        assert_eq!(resolve_tier_price(&tiers, 0).unwrap(), dec!(9.00));
        assert_eq!(resolve_tier_price(&tiers, 10).unwrap(), dec!(9.00));
        assert_eq!(resolve_tier_price(&tiers, 11).unwrap(), dec!(7.50));
        assert_eq!(resolve_tier_price(&tiers, 50).unwrap(), dec!(7.50));
        assert_eq!(resolve_tier_price(&tiers, 51).unwrap(), dec!(6.00));
        assert_eq!(resolve_tier_price(&tiers, 100_000).unwrap(), dec!(6.00));
    }

    #[test]
    fn uncovered_count_is_a_configuration_defect() {
        let gappy = vec![PricingTier {
            min_units: 10,
            max_units: None,
            price_per_unit: dec!(5.00),
        }];
        assert!(matches!(
            resolve_tier_price(&gappy, 3),
            Err(EngineError::TierNotFound { unit_count: 3 })
        ));
    }

    #[test]
    fn minimum_floor_applies_only_with_charge_minimum() {
        assert_eq!(effective_units(10, true, 6), 10);
        assert_eq!(effective_units(10, false, 6), 6);
        assert_eq!(effective_units(10, true, 14), 14);
        // Never negative, with or without the floor.
        assert_eq!(effective_units(0, false, -3), 0);
    }

    #[test]
    fn whole_count_is_billed_at_one_flat_rate() {
        let plan = plan_with_tiers(0, tiers());
        // 30 units land in the middle tier; all 30 are billed at 7.50.
        assert_eq!(
            compute_monthly_charge(&plan, 30, true).unwrap(),
            dec!(225.00)
        );
    }

    #[test]
    fn floored_count_picks_the_tier() {
        let plan = plan_with_tiers(12, tiers());
        // 6 billable units floored to 12, which lands in the second tier.
        assert_eq!(
            compute_monthly_charge(&plan, 6, true).unwrap(),
            dec!(90.00)
        );
    }
}
