//! Subscription ledger.
//!
//! The single authoritative mutation path for subscriptions and their
//! tenant attachments. Every operation runs in one transaction holding a
//! `FOR UPDATE` lock on the subscription row (and the tenant row for
//! attach/detach), so mutations for the same subscription serialize and a
//! partial attach is never observable.
//!
//! `used_licenses` is a derived cache with exactly one writer: the
//! recalculation path in this module. Everything else treats it as a
//! read-only projection.

use condoledger_shared::{AttachmentStatus, SubscriptionStatus, TenantAccess};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit;
use crate::error::{EngineError, EngineResult};
use crate::events::{ActorType, DomainEventBuilder, DomainEventLogger, DomainEventType};
use crate::plan::{load_plan, Plan};
use crate::pricing::effective_units;
use crate::usage;

/// Lock reason applied to tenants of an expired subscription. Attachments
/// stay active so a later payment can reinstate without re-attaching.
pub const EXPIRED_LOCK_REASON: &str = "subscription expired - payment pending";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub used_licenses: i32,
    pub license_limit: Option<i32>,
    pub allow_overage: Option<bool>,
    pub charge_minimum: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
}

impl Subscription {
    fn parsed_status(&self) -> EngineResult<SubscriptionStatus> {
        self.status
            .parse()
            .map_err(|reason: String| EngineError::Integrity(reason))
    }
}

/// Read-only view used by dry-run reporting.
#[derive(Debug, Clone)]
pub struct UsagePreview {
    pub subscription_id: Uuid,
    pub cached: i64,
    pub expected: i64,
}

impl UsagePreview {
    pub fn is_stale(&self) -> bool {
        self.cached != self.expected
    }
}

/// Effective license limit: per-subscription override wins over the plan
/// default. `None` means uncapped.
pub(crate) fn effective_limit(plan: &Plan, subscription_limit: Option<i64>) -> Option<i64> {
    subscription_limit.or_else(|| plan.capacity.default_limit())
}

/// Prospective usage after attaching a tenant, with the minimum floor
/// applied the same way recalculation applies it.
pub(crate) fn prospective_usage(
    current_aggregate: i64,
    candidate_units: i64,
    license_min: i64,
    charge_minimum: bool,
) -> i64 {
    effective_units(
        license_min,
        charge_minimum,
        current_aggregate + candidate_units,
    )
}

/// Capacity policy: over the limit is only acceptable with an overage
/// allowance.
pub(crate) fn check_capacity(
    limit: Option<i64>,
    allow_overage: bool,
    prospective: i64,
) -> EngineResult<()> {
    match limit {
        Some(limit) if prospective > limit && !allow_overage => {
            Err(EngineError::CapacityExceeded { prospective, limit })
        }
        _ => Ok(()),
    }
}

async fn lock_subscription(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
) -> EngineResult<Subscription> {
    sqlx::query_as(
        "SELECT id, owner_id, plan_id, status, used_licenses, license_limit, allow_overage,
                charge_minimum, current_period_start, current_period_end, trial_ends_at
         FROM subscriptions WHERE id = $1 FOR UPDATE",
    )
    .bind(subscription_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))
}

/// Take the tenant row lock; attach and detach both acquire subscription
/// first, then tenant, so the two operations cannot deadlock each other.
async fn lock_tenant(tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> EngineResult<Uuid> {
    let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;
    locked.ok_or_else(|| EngineError::NotFound(format!("tenant {tenant_id}")))
}

fn snapshot(sub: &Subscription) -> serde_json::Value {
    serde_json::json!({
        "status": sub.status,
        "plan_id": sub.plan_id,
        "used_licenses": sub.used_licenses,
        "current_period_start": sub.current_period_start.map(|t| t.to_string()),
        "current_period_end": sub.current_period_end.map(|t| t.to_string()),
    })
}

/// Orchestrates attach/detach, capacity checks, recalculation and status
/// transitions.
#[derive(Clone)]
pub struct SubscriptionLedger {
    pool: PgPool,
    events: DomainEventLogger,
}

impl SubscriptionLedger {
    pub fn new(pool: PgPool) -> Self {
        let events = DomainEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Re-derive `used_licenses` from the attached tenants and write it
    /// back. Idempotent; safe to call repeatedly.
    pub async fn recalculate(&self, subscription_id: Uuid) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, subscription_id).await?;
        let plan = load_plan(&mut tx, sub.plan_id).await?;
        let used = Self::recalculate_in_tx(&mut tx, &sub, &plan).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            used_licenses = used,
            "Recalculated license usage"
        );
        Ok(used)
    }

    /// Recalculation step shared by every mutating operation. Expects the
    /// subscription row to be locked by the caller's transaction.
    async fn recalculate_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
        plan: &Plan,
    ) -> EngineResult<i64> {
        let aggregate = usage::aggregate_for_subscription(&mut **tx, sub.id).await?;
        let used = effective_units(plan.license_min, sub.charge_minimum, aggregate);
        sqlx::query("UPDATE subscriptions SET used_licenses = $1, updated_at = NOW() WHERE id = $2")
            .bind(i32::try_from(used).map_err(|_| {
                EngineError::Integrity(format!("license usage {used} out of range"))
            })?)
            .bind(sub.id)
            .execute(&mut **tx)
            .await?;
        Ok(used)
    }

    /// What recalculation would write, without locks or writes. Used by
    /// the batch job's dry-run path.
    pub async fn preview_usage(&self, subscription_id: Uuid) -> EngineResult<UsagePreview> {
        let mut conn = self.pool.acquire().await?;
        let sub: Subscription = sqlx::query_as(
            "SELECT id, owner_id, plan_id, status, used_licenses, license_limit, allow_overage,
                    charge_minimum, current_period_start, current_period_end, trial_ends_at
             FROM subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))?;

        let plan = load_plan(&mut conn, sub.plan_id).await?;
        let aggregate = usage::aggregate_for_subscription(&mut *conn, subscription_id).await?;
        let expected = effective_units(plan.license_min, sub.charge_minimum, aggregate);

        Ok(UsagePreview {
            subscription_id,
            cached: i64::from(sub.used_licenses),
            expected,
        })
    }

    /// Attach a tenant to a subscription.
    ///
    /// All validation happens before any write; the insert, the tenant
    /// unlock and the recalculation commit together or not at all.
    pub async fn attach_tenant(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        actor_id: Uuid,
    ) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, subscription_id).await?;
        let status = sub.parsed_status()?;
        if !status.is_live() {
            return Err(EngineError::Validation(format!(
                "cannot attach a tenant to a {status} subscription"
            )));
        }
        lock_tenant(&mut tx, tenant_id).await?;
        let plan = load_plan(&mut tx, sub.plan_id).await?;

        if !plan.capacity.allows_multiple_tenants() {
            let attached: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM tenant_attachments
                 WHERE subscription_id = $1 AND status = 'active'",
            )
            .bind(subscription_id)
            .fetch_one(&mut *tx)
            .await?;
            if attached > 0 {
                return Err(EngineError::SingleTenantViolation);
            }
        }

        let attached_elsewhere: Option<Uuid> = sqlx::query_scalar(
            "SELECT subscription_id FROM tenant_attachments
             WHERE tenant_id = $1 AND status = 'active'",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = attached_elsewhere {
            return Err(EngineError::Validation(format!(
                "tenant {tenant_id} already has an active attachment to subscription {existing}"
            )));
        }

        let current = usage::aggregate_for_subscription(&mut *tx, subscription_id).await?;
        let candidate = usage::count_billable_units(&mut *tx, tenant_id).await?;
        let prospective =
            prospective_usage(current, candidate, plan.license_min, sub.charge_minimum);
        let limit = effective_limit(&plan, sub.license_limit.map(i64::from));
        let allow_overage = sub.allow_overage.unwrap_or(plan.allow_overage);
        check_capacity(limit, allow_overage, prospective)?;

        sqlx::query(
            "INSERT INTO tenant_attachments (subscription_id, tenant_id, status, attached_at)
             VALUES ($1, $2, $3, NOW())",
        )
        .bind(subscription_id)
        .bind(tenant_id)
        .bind(AttachmentStatus::Active.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tenants
             SET subscription_id = $1, access_state = $2, locked_at = NULL, locked_reason = NULL
             WHERE id = $3",
        )
        .bind(subscription_id)
        .bind(TenantAccess::Active.as_str())
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        let used = Self::recalculate_in_tx(&mut tx, &sub, &plan).await?;

        let before = snapshot(&sub);
        let mut after_sub = sub.clone();
        after_sub.used_licenses = used as i32;
        audit::record(
            &mut tx,
            "attach_tenant",
            subscription_id,
            &before,
            &snapshot(&after_sub),
            Some(actor_id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            tenant_id = %tenant_id,
            used_licenses = used,
            "Attached tenant"
        );

        if let Err(e) = self
            .events
            .log(
                DomainEventBuilder::new(DomainEventType::TenantAttached)
                    .subscription(subscription_id)
                    .tenant(tenant_id)
                    .payload(serde_json::json!({ "used_licenses": used }))
                    .actor_opt(Some(actor_id), ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log tenant attached event");
        }

        Ok(used)
    }

    /// Detach a tenant: mark the attachment, lock the tenant, recompute
    /// usage. Attachment history is never deleted.
    pub async fn detach_tenant(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        actor_id: Uuid,
        reason: &str,
    ) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, subscription_id).await?;
        lock_tenant(&mut tx, tenant_id).await?;

        let attachment_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM tenant_attachments
             WHERE subscription_id = $1 AND tenant_id = $2 AND status = 'active'",
        )
        .bind(subscription_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        let attachment_id = attachment_id.ok_or_else(|| {
            EngineError::NotFound(format!(
                "no active attachment of tenant {tenant_id} to subscription {subscription_id}"
            ))
        })?;

        sqlx::query(
            "UPDATE tenant_attachments
             SET status = $1, detached_at = NOW(), detached_by = $2, notes = $3
             WHERE id = $4",
        )
        .bind(AttachmentStatus::Detached.as_str())
        .bind(actor_id)
        .bind(reason)
        .bind(attachment_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tenants
             SET subscription_id = NULL, access_state = $1, locked_at = NOW(), locked_reason = $2
             WHERE id = $3",
        )
        .bind(TenantAccess::Locked.as_str())
        .bind(reason)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        let plan = load_plan(&mut tx, sub.plan_id).await?;
        let used = Self::recalculate_in_tx(&mut tx, &sub, &plan).await?;

        let before = snapshot(&sub);
        let mut after_sub = sub.clone();
        after_sub.used_licenses = used as i32;
        audit::record(
            &mut tx,
            "detach_tenant",
            subscription_id,
            &before,
            &snapshot(&after_sub),
            Some(actor_id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            tenant_id = %tenant_id,
            used_licenses = used,
            reason = %reason,
            "Detached tenant"
        );

        if let Err(e) = self
            .events
            .log(
                DomainEventBuilder::new(DomainEventType::TenantDetached)
                    .subscription(subscription_id)
                    .tenant(tenant_id)
                    .payload(serde_json::json!({ "reason": reason, "used_licenses": used }))
                    .actor_opt(Some(actor_id), ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log tenant detached event");
        }

        Ok(used)
    }

    /// Expire a subscription and lock every attached tenant. Attachments
    /// stay active so reinstatement does not need to re-attach.
    pub async fn expire_subscription(&self, subscription_id: Uuid) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, subscription_id).await?;
        let status = sub.parsed_status()?;
        match status {
            SubscriptionStatus::Expired => return Ok(()),
            SubscriptionStatus::Canceled => {
                return Err(EngineError::Validation(
                    "cannot expire a canceled subscription".to_string(),
                ));
            }
            _ => {}
        }

        sqlx::query("UPDATE subscriptions SET status = 'expired', updated_at = NOW() WHERE id = $1")
            .bind(subscription_id)
            .execute(&mut *tx)
            .await?;

        let locked = sqlx::query(
            "UPDATE tenants
             SET access_state = $1, locked_at = NOW(), locked_reason = $2
             WHERE id IN (
                 SELECT tenant_id FROM tenant_attachments
                 WHERE subscription_id = $3 AND status = 'active'
             )",
        )
        .bind(TenantAccess::Locked.as_str())
        .bind(EXPIRED_LOCK_REASON)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let before = snapshot(&sub);
        let mut after_sub = sub.clone();
        after_sub.status = SubscriptionStatus::Expired.as_str().to_string();
        audit::record(
            &mut tx,
            "expire_subscription",
            subscription_id,
            &before,
            &snapshot(&after_sub),
            None,
        )
        .await?;

        tx.commit().await?;

        tracing::warn!(
            subscription_id = %subscription_id,
            tenants_locked = locked,
            "Subscription expired"
        );

        if let Err(e) = self
            .events
            .log(
                DomainEventBuilder::new(DomainEventType::SubscriptionExpired)
                    .subscription(subscription_id)
                    .payload(serde_json::json!({ "tenants_locked": locked })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription expired event");
        }

        Ok(())
    }

    /// Undo an expiration after payment: reactivate the subscription and
    /// unlock its still-attached tenants.
    pub async fn reinstate_subscription(&self, subscription_id: Uuid) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, subscription_id).await?;
        let status = sub.parsed_status()?;
        if !matches!(
            status,
            SubscriptionStatus::Expired | SubscriptionStatus::Suspended
        ) {
            return Err(EngineError::Validation(format!(
                "cannot reinstate a {status} subscription"
            )));
        }

        sqlx::query("UPDATE subscriptions SET status = 'active', updated_at = NOW() WHERE id = $1")
            .bind(subscription_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE tenants
             SET access_state = $1, locked_at = NULL, locked_reason = NULL
             WHERE id IN (
                 SELECT tenant_id FROM tenant_attachments
                 WHERE subscription_id = $2 AND status = 'active'
             )",
        )
        .bind(TenantAccess::Active.as_str())
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?;

        let plan = load_plan(&mut tx, sub.plan_id).await?;
        let used = Self::recalculate_in_tx(&mut tx, &sub, &plan).await?;

        let before = snapshot(&sub);
        let mut after_sub = sub.clone();
        after_sub.status = SubscriptionStatus::Active.as_str().to_string();
        after_sub.used_licenses = used as i32;
        audit::record(
            &mut tx,
            "reinstate_subscription",
            subscription_id,
            &before,
            &snapshot(&after_sub),
            None,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            used_licenses = used,
            "Subscription reinstated"
        );

        if let Err(e) = self
            .events
            .log(
                DomainEventBuilder::new(DomainEventType::SubscriptionReinstated)
                    .subscription(subscription_id)
                    .payload(serde_json::json!({ "used_licenses": used })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription reinstated event");
        }

        Ok(used)
    }
}
