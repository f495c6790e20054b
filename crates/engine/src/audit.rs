//! Append-only audit trail for ledger mutations.
//!
//! Every mutation of a subscription writes one record with before/after
//! snapshots, inside the same transaction as the mutation itself. The
//! engine never reads these rows back.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::EngineResult;

/// Write an audit record on the caller's transaction.
pub async fn record(
    tx: &mut Transaction<'_, Postgres>,
    action: &str,
    subscription_id: Uuid,
    before: &serde_json::Value,
    after: &serde_json::Value,
    performed_by: Option<Uuid>,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_audit (action, subscription_id, before, after, performed_by)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(action)
    .bind(subscription_id)
    .bind(before)
    .bind(after)
    .bind(performed_by)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
