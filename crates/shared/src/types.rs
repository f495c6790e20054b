//! Common types used across CondoLedger

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Capacity policy of a billing plan.
///
/// Stored as `plan_type` + `license_limit_default` columns; decoded into a
/// closed variant so capacity rules are matched exhaustively instead of by
/// string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PlanCapacity {
    /// Exactly one tenant may be attached. An optional cap still applies
    /// to that tenant's unit count.
    SingleTenant { license_limit: Option<i64> },
    /// Any number of tenants, bounded by a mandatory license cap.
    MultiTenantCapped { license_limit: i64 },
    /// Any number of tenants, no cap.
    MultiTenantUncapped,
}

impl PlanCapacity {
    /// Decode from the persisted representation. A capped multi-tenant
    /// plan without a limit is a configuration defect, not a valid state.
    pub fn decode(plan_type: &str, license_limit_default: Option<i64>) -> Result<Self, String> {
        match plan_type {
            "single_tenant" => Ok(Self::SingleTenant {
                license_limit: license_limit_default,
            }),
            "multi_tenant_capped" => match license_limit_default {
                Some(limit) => Ok(Self::MultiTenantCapped {
                    license_limit: limit,
                }),
                None => Err("multi_tenant_capped plan has no license limit".to_string()),
            },
            "multi_tenant_uncapped" => Ok(Self::MultiTenantUncapped),
            other => Err(format!("unknown plan type '{other}'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleTenant { .. } => "single_tenant",
            Self::MultiTenantCapped { .. } => "multi_tenant_capped",
            Self::MultiTenantUncapped => "multi_tenant_uncapped",
        }
    }

    pub fn allows_multiple_tenants(&self) -> bool {
        !matches!(self, Self::SingleTenant { .. })
    }

    /// Plan-level license cap, before any per-subscription override.
    pub fn default_limit(&self) -> Option<i64> {
        match self {
            Self::SingleTenant { license_limit } => *license_limit,
            Self::MultiTenantCapped { license_limit } => Some(*license_limit),
            Self::MultiTenantUncapped => None,
        }
    }
}

impl fmt::Display for PlanCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle state. `Canceled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// States in which the subscription still owns its attachments and the
    /// usage cache is kept current.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active | Self::Suspended)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown subscription status '{other}'")),
        }
    }
}

/// Tenant access state. A tenant is locked whenever its subscription is
/// detached, suspended, or expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantAccess {
    Active,
    Locked,
    ReadOnly,
}

impl TenantAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::ReadOnly => "read_only",
        }
    }
}

impl fmt::Display for TenantAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TenantAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "locked" => Ok(Self::Locked),
            "read_only" => Ok(Self::ReadOnly),
            other => Err(format!("unknown tenant access state '{other}'")),
        }
    }
}

/// Attachment rows are append-only; detaching marks, never deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Active,
    Detached,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    Regular,
    Extra,
}

impl FeeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Extra => "extra",
        }
    }
}

impl fmt::Display for FeeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Pending,
    Paid,
    Overdue,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
        }
    }
}

impl FromStr for FeeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "overdue" => Ok(Self::Overdue),
            other => Err(format!("unknown fee status '{other}'")),
        }
    }
}

/// A billing period: a year with an optional month. No month means an
/// annual charge, which sorts after every monthly charge of the same year
/// so settlement order stays well defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: Option<u8>,
}

impl Period {
    pub fn monthly(year: i32, month: u8) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    pub fn annual(year: i32) -> Self {
        Self { year, month: None }
    }

    fn sort_month(&self) -> u8 {
        // Annual periods sort after December of the same year.
        self.month.unwrap_or(13)
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.sort_month()).cmp(&(other.year, other.sort_month()))
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(m) => write!(f, "{}-{:02}", self.year, m),
            None => write!(f, "{}", self.year),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_capacity_decodes_known_kinds() {
        assert_eq!(
            PlanCapacity::decode("single_tenant", Some(10)),
            Ok(PlanCapacity::SingleTenant {
                license_limit: Some(10)
            })
        );
        assert_eq!(
            PlanCapacity::decode("multi_tenant_capped", Some(60)),
            Ok(PlanCapacity::MultiTenantCapped { license_limit: 60 })
        );
        assert_eq!(
            PlanCapacity::decode("multi_tenant_uncapped", None),
            Ok(PlanCapacity::MultiTenantUncapped)
        );
    }

    #[test]
    fn capped_plan_without_limit_is_rejected() {
        assert!(PlanCapacity::decode("multi_tenant_capped", None).is_err());
        assert!(PlanCapacity::decode("bespoke", None).is_err());
    }

    #[test]
    fn status_round_trips() {
        for s in ["trial", "active", "suspended", "canceled", "expired"] {
            let parsed: SubscriptionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("unknown".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn annual_period_sorts_after_monthly_of_same_year() {
        let december = Period::monthly(2024, 12);
        let annual = Period::annual(2024);
        let next_january = Period::monthly(2025, 1);

        assert!(december < annual);
        assert!(annual < next_january);
    }

    #[test]
    fn periods_order_chronologically() {
        let mut periods = vec![
            Period::monthly(2025, 3),
            Period::annual(2024),
            Period::monthly(2024, 1),
            Period::monthly(2025, 1),
        ];
        periods.sort();
        assert_eq!(
            periods,
            vec![
                Period::monthly(2024, 1),
                Period::annual(2024),
                Period::monthly(2025, 1),
                Period::monthly(2025, 3),
            ]
        );
    }
}
