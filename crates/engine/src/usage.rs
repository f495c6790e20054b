//! License usage calculation.
//!
//! Read-only counting of billable units. The free functions take any
//! executor so a mutating caller can run them on its own open transaction;
//! a count read outside the transaction that later writes from it would be
//! a read-modify-write race.

use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::EngineResult;

/// Units that consume a license: active, license-consuming, not archived.
pub async fn count_billable_units<'e, E>(executor: E, tenant_id: Uuid) -> EngineResult<i64>
where
    E: PgExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units
         WHERE tenant_id = $1
           AND is_active
           AND license_consumed
           AND archived_at IS NULL",
    )
    .bind(tenant_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

/// Billable units summed over every actively attached tenant.
pub async fn aggregate_for_subscription<'e, E>(
    executor: E,
    subscription_id: Uuid,
) -> EngineResult<i64>
where
    E: PgExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(u.id)
         FROM tenant_attachments ta
         JOIN units u ON u.tenant_id = ta.tenant_id
         WHERE ta.subscription_id = $1
           AND ta.status = 'active'
           AND u.is_active
           AND u.license_consumed
           AND u.archived_at IS NULL",
    )
    .bind(subscription_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

/// Pool-backed access for read-only callers (reporting, previews).
#[derive(Clone)]
pub struct LicenseUsageService {
    pool: PgPool,
}

impl LicenseUsageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count_billable_units(&self, tenant_id: Uuid) -> EngineResult<i64> {
        count_billable_units(&self.pool, tenant_id).await
    }

    pub async fn aggregate_for_subscription(&self, subscription_id: Uuid) -> EngineResult<i64> {
        aggregate_for_subscription(&self.pool, subscription_id).await
    }
}
