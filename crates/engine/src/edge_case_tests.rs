// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Accounting Engine
//!
//! Tests critical boundary conditions in:
//! - Capacity policy and the minimum floor
//! - Tier resolution at range boundaries
//! - Weight-proportional fee distribution and rounding
//! - Oldest-first payment settlement

#[cfg(test)]
mod capacity_tests {
    use crate::error::EngineError;
    use crate::ledger::{check_capacity, effective_limit, prospective_usage};
    use crate::plan::{Plan, PricingTier};
    use crate::pricing::effective_units;
    use condoledger_shared::PlanCapacity;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn capped_plan(limit: i64) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "capped".to_string(),
            capacity: PlanCapacity::MultiTenantCapped {
                license_limit: limit,
            },
            license_min: 0,
            allow_overage: false,
            tiers: vec![PricingTier {
                min_units: 0,
                max_units: None,
                price_per_unit: dec!(4.00),
            }],
        }
    }

    // =========================================================================
    // Minimum floor: licenseMin 10 with 6 billable units charges 10
    // =========================================================================
    #[test]
    fn floor_raises_small_usage() {
        assert_eq!(effective_units(10, true, 6), 10);
    }

    #[test]
    fn floor_is_inert_above_minimum() {
        assert_eq!(effective_units(10, true, 10), 10);
        assert_eq!(effective_units(10, true, 11), 11);
    }

    // =========================================================================
    // Multi-tenant summation: 30 + 40 attached units derive 70
    // =========================================================================
    #[test]
    fn attached_tenants_sum() {
        assert_eq!(prospective_usage(30, 40, 0, true), 70);
    }

    // =========================================================================
    // Detach recomputation: dropping the 40-unit tenant derives 30
    // =========================================================================
    #[test]
    fn usage_after_detach_reflects_remaining_tenants() {
        // After detach the aggregate no longer includes the detached
        // tenant's units; recomputation floors the remainder.
        assert_eq!(effective_units(0, true, 30), 30);
        assert_eq!(effective_units(35, true, 30), 35);
    }

    // =========================================================================
    // Capacity: at 60/60, attaching 10 more fails without overage
    // =========================================================================
    #[test]
    fn full_subscription_rejects_next_tenant() {
        let plan = capped_plan(60);
        let prospective = prospective_usage(60, 10, plan.license_min, true);
        let limit = effective_limit(&plan, None);
        let err = check_capacity(limit, false, prospective).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                prospective: 70,
                limit: 60
            }
        ));
    }

    // =========================================================================
    // Capacity: the same attach succeeds with an overage allowance
    // =========================================================================
    #[test]
    fn overage_allowance_admits_the_same_tenant() {
        let plan = capped_plan(60);
        let prospective = prospective_usage(60, 10, plan.license_min, true);
        assert!(check_capacity(effective_limit(&plan, None), true, prospective).is_ok());
        assert_eq!(prospective, 70);
    }

    // =========================================================================
    // Boundary: landing exactly on the limit is not an overage
    // =========================================================================
    #[test]
    fn exactly_at_limit_is_accepted() {
        assert!(check_capacity(Some(60), false, 60).is_ok());
        assert!(check_capacity(Some(60), false, 61).is_err());
    }

    // =========================================================================
    // Single-tenant plans still cap the one tenant they allow
    // =========================================================================
    #[test]
    fn single_tenant_plan_can_carry_its_own_cap() {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "single".to_string(),
            capacity: PlanCapacity::SingleTenant {
                license_limit: Some(25),
            },
            license_min: 10,
            allow_overage: false,
            tiers: vec![PricingTier {
                min_units: 0,
                max_units: None,
                price_per_unit: dec!(4.00),
            }],
        };
        assert!(!plan.capacity.allows_multiple_tenants());
        assert_eq!(effective_limit(&plan, None), Some(25));
        assert!(check_capacity(Some(25), false, 26).is_err());
    }
}

#[cfg(test)]
mod pricing_tests {
    use crate::plan::{Plan, PricingTier};
    use crate::pricing::compute_monthly_charge;
    use condoledger_shared::PlanCapacity;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "tiered".to_string(),
            capacity: PlanCapacity::MultiTenantUncapped,
            license_min: 10,
            allow_overage: true,
            tiers: vec![
                PricingTier {
                    min_units: 0,
                    max_units: Some(24),
                    price_per_unit: dec!(8.00),
                },
                PricingTier {
                    min_units: 25,
                    max_units: None,
                    price_per_unit: dec!(6.50),
                },
            ],
        }
    }

    // =========================================================================
    // The floor can move the whole charge into a higher tier
    // =========================================================================
    #[test]
    fn floored_usage_is_charged_at_the_floor() {
        // 6 billable units, floored to 10, all billed at the first tier.
        assert_eq!(
            compute_monthly_charge(&plan(), 6, true).unwrap(),
            dec!(80.00)
        );
    }

    #[test]
    fn crossing_a_tier_boundary_reprices_every_unit() {
        let p = plan();
        assert_eq!(compute_monthly_charge(&p, 24, true).unwrap(), dec!(192.00));
        // One more unit and all 25 bill at the cheaper tier.
        assert_eq!(compute_monthly_charge(&p, 25, true).unwrap(), dec!(162.50));
    }

    #[test]
    fn without_the_floor_zero_usage_costs_nothing() {
        assert_eq!(
            compute_monthly_charge(&plan(), 0, false).unwrap(),
            dec!(0.00)
        );
    }
}

#[cfg(test)]
mod fee_distribution_tests {
    use crate::fees::{distribute_by_weight, fee_reference};
    use condoledger_shared::{FeeKind, Period};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    // =========================================================================
    // Regeneration determinism: same period key, same amounts and refs
    // =========================================================================
    #[test]
    fn regeneration_derives_identical_fees() {
        let weights = [120, 95, 310, 475];
        let first = distribute_by_weight(dec!(1250.00), &weights);
        let second = distribute_by_weight(dec!(1250.00), &weights);
        assert_eq!(first, second);

        let unit = Uuid::new_v4();
        assert_eq!(
            fee_reference(FeeKind::Regular, unit, Period::monthly(2025, 6), ""),
            fee_reference(FeeKind::Regular, unit, Period::monthly(2025, 6), ""),
        );
    }

    // =========================================================================
    // A single-unit tenant receives the whole monthly total
    // =========================================================================
    #[test]
    fn lone_unit_carries_the_full_amount() {
        let amounts = distribute_by_weight(dec!(412.37), &[1000]);
        assert_eq!(amounts, vec![dec!(412.37)]);
    }

    // =========================================================================
    // Uneven permillages: every share lands on two decimals
    // =========================================================================
    #[test]
    fn shares_always_round_to_cents() {
        let amounts = distribute_by_weight(dec!(997.77), &[133, 267, 401, 199]);
        for amount in &amounts {
            assert_eq!(amount.scale(), 2, "share {amount} is not cent-rounded");
        }
        let sum: Decimal = amounts.iter().sum();
        let drift = (sum - dec!(997.77)).abs();
        assert!(drift <= dec!(0.04), "drift {drift} beyond one cent per unit");
    }

    // =========================================================================
    // Extra fees split the total across months before units
    // =========================================================================
    #[test]
    fn per_month_split_matches_manual_division() {
        let total = dec!(900.00);
        let months = 3u32;
        let per_month = total / Decimal::from(months);
        let amounts = distribute_by_weight(per_month, &[600, 400]);
        assert_eq!(amounts, vec![dec!(180.00), dec!(120.00)]);
    }
}

#[cfg(test)]
mod allocation_tests {
    use crate::payments::{plan_allocation, OutstandingFee};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn fee(year: i32, month: Option<i32>, amount: Decimal) -> OutstandingFee {
        OutstandingFee {
            id: Uuid::new_v4(),
            year,
            month,
            amount,
            paid: Decimal::ZERO,
        }
    }

    // =========================================================================
    // Paying "for" a later period still settles the older debt first
    // =========================================================================
    #[test]
    fn nominal_target_is_ignored() {
        let fees = vec![
            fee(2024, Some(1), dec!(50.00)),
            fee(2025, Some(1), dec!(50.00)),
        ];
        // The payer intended to cover the 2025 fee; allocation starts at
        // the oldest open period regardless.
        let (allocations, _) = plan_allocation(&fees, dec!(50.00));
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].fee_id, fees[0].id);
        assert!(allocations[0].settles);
    }

    // =========================================================================
    // Annual fees queue behind the months of their year
    // =========================================================================
    #[test]
    fn annual_fee_waits_for_december() {
        // Sorting by period mirrors the (year, month NULLS LAST) fetch
        // order: the annual fee queues behind December.
        let mut fees = vec![
            fee(2024, None, dec!(100.00)),
            fee(2024, Some(12), dec!(30.00)),
        ];
        fees.sort_by_key(|f| f.period());
        assert_eq!(fees[0].month, Some(12));

        let (allocations, _) = plan_allocation(&fees, dec!(40.00));
        assert_eq!(allocations.len(), 2);
        assert!(allocations[0].settles);
        assert_eq!(allocations[1].amount, dec!(10.00));
        assert!(!allocations[1].settles);
    }

    // =========================================================================
    // Zero-outstanding rows in the queue never absorb anything
    // =========================================================================
    #[test]
    fn fully_covered_rows_are_transparent() {
        let mut covered = fee(2024, Some(1), dec!(20.00));
        covered.paid = dec!(20.00);
        let open = fee(2024, Some(2), dec!(20.00));
        let fees = vec![covered, open.clone()];

        let (allocations, remainder) = plan_allocation(&fees, dec!(20.00));
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].fee_id, open.id);
        assert_eq!(remainder, Decimal::ZERO);
    }

    // =========================================================================
    // Exhausting the queue leaves the surplus as credit
    // =========================================================================
    #[test]
    fn empty_queue_turns_the_whole_payment_into_credit() {
        let (allocations, remainder) = plan_allocation(&[], dec!(75.00));
        assert!(allocations.is_empty());
        assert_eq!(remainder, dec!(75.00));
    }

    // =========================================================================
    // Cent-level partials: no allocation ever exceeds the outstanding
    // =========================================================================
    #[test]
    fn allocations_never_exceed_outstanding() {
        let fees = vec![
            fee(2024, Some(1), dec!(0.01)),
            fee(2024, Some(2), dec!(99.99)),
        ];
        let (allocations, remainder) = plan_allocation(&fees, dec!(100.00));
        assert_eq!(allocations[0].amount, dec!(0.01));
        assert_eq!(allocations[1].amount, dec!(99.99));
        assert_eq!(remainder, Decimal::ZERO);
        let total: Decimal = allocations.iter().map(|a| a.amount).sum();
        assert_eq!(total, dec!(100.00));
    }
}
