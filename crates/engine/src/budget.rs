//! Approved-budget provider.
//!
//! Fee generation draws on the approved annual budget of a tenant. A
//! missing or unapproved budget is a distinct error, not a generic
//! not-found, so batch jobs can report "skipped: no approved budget"
//! without string matching.

use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct ApprovedBudget {
    pub budget_id: Uuid,
    pub tenant_id: Uuid,
    pub year: i32,
    /// Sum of all revenue line items.
    pub total_revenue: Decimal,
}

/// Fetch the approved budget for `(tenant, year)` on the caller's
/// connection.
pub async fn get_approved_budget(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    year: i32,
) -> EngineResult<ApprovedBudget> {
    let budget_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM budgets
         WHERE tenant_id = $1 AND year = $2 AND status = 'approved'",
    )
    .bind(tenant_id)
    .bind(year)
    .fetch_optional(&mut *conn)
    .await?;

    let budget_id = budget_id.ok_or(EngineError::BudgetNotApproved { tenant_id, year })?;

    let total_revenue: Decimal = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)
         FROM budget_revenue_lines WHERE budget_id = $1",
    )
    .bind(budget_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(ApprovedBudget {
        budget_id,
        tenant_id,
        year,
        total_revenue,
    })
}

#[derive(Clone)]
pub struct BudgetService {
    pool: PgPool,
}

impl BudgetService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_approved_budget(
        &self,
        tenant_id: Uuid,
        year: i32,
    ) -> EngineResult<ApprovedBudget> {
        let mut conn = self.pool.acquire().await?;
        get_approved_budget(&mut conn, tenant_id, year).await
    }

    /// Tenants holding an approved budget for `year`; the fee-generation
    /// job iterates this list.
    pub async fn tenants_with_approved_budget(&self, year: i32) -> EngineResult<Vec<Uuid>> {
        let tenants = sqlx::query_scalar(
            "SELECT tenant_id FROM budgets
             WHERE year = $1 AND status = 'approved'
             ORDER BY tenant_id",
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }
}
