//! Periodic fee generation.
//!
//! Materializes per-unit fees from an approved annual budget. Generation
//! is idempotent per period key: an existing fee is reported as skipped
//! after an explicit existence check, never re-created and never detected
//! by catching a duplicate-key error. Each tenant's generation is one
//! transaction, so a batch run that dies mid-way leaves no partial
//! per-tenant state and can simply be re-run.

use condoledger_shared::{FeeKind, FeeStatus, Period};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, Month};
use uuid::Uuid;

use crate::budget;
use crate::error::{EngineError, EngineResult};
use crate::events::{DomainEventBuilder, DomainEventLogger, DomainEventType};

/// Day of month on which generated fees fall due.
const DUE_DAY: u8 = 10;

/// Two-decimal money rounding, half away from zero.
pub(crate) fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Split `total` across units proportionally to weight, rounding each
/// share to two decimals. The rounded shares may drift from `total` by at
/// most one rounding unit per share; the drift is accepted, not
/// redistributed.
pub fn distribute_by_weight(total: Decimal, weights: &[i64]) -> Vec<Decimal> {
    let total_weight: i64 = weights.iter().sum();
    weights
        .iter()
        .map(|&w| round2(total * Decimal::from(w) / Decimal::from(total_weight)))
        .collect()
}

fn label_slug(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut last_dash = true;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Deterministic fee reference, reproducible from the period key alone so
/// regeneration always derives the same value. Annual periods use month 00.
pub fn fee_reference(kind: FeeKind, unit_id: Uuid, period: Period, label: &str) -> String {
    let prefix = match kind {
        FeeKind::Regular => "REG",
        FeeKind::Extra => "EXT",
    };
    let base = format!(
        "{prefix}-{}-{:02}-{}",
        period.year,
        period.month.unwrap_or(0),
        short_id(unit_id)
    );
    if label.is_empty() {
        base
    } else {
        format!("{base}-{}", label_slug(label))
    }
}

fn due_date_for(year: i32, month: u8) -> EngineResult<Date> {
    let month = Month::try_from(month)
        .map_err(|_| EngineError::Validation(format!("month {month} out of range")))?;
    Date::from_calendar_date(year, month, DUE_DAY)
        .map_err(|e| EngineError::Validation(format!("invalid due date for {year}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeOutcome {
    Created,
    Skipped,
}

/// One per-unit line of a generation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GeneratedFee {
    pub unit_id: Uuid,
    pub year: i32,
    pub month: u8,
    pub reference: String,
    pub amount: Decimal,
    pub outcome: FeeOutcome,
}

/// Result of one generation call. Built before the commit/rollback
/// decision, so the dry-run report is identical to the live one.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationReport {
    pub tenant_id: Uuid,
    pub created: usize,
    pub skipped: usize,
    pub dry_run: bool,
    pub fees: Vec<GeneratedFee>,
}

impl GenerationReport {
    fn new(tenant_id: Uuid, dry_run: bool) -> Self {
        Self {
            tenant_id,
            created: 0,
            skipped: 0,
            dry_run,
            fees: Vec::new(),
        }
    }

    fn push(&mut self, fee: GeneratedFee) {
        match fee.outcome {
            FeeOutcome::Created => self.created += 1,
            FeeOutcome::Skipped => self.skipped += 1,
        }
        self.fees.push(fee);
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UnitRow {
    id: Uuid,
    weight: i32,
}

/// Generates regular and extra fees and flags overdue ones.
#[derive(Clone)]
pub struct FeeGenerationService {
    pool: PgPool,
    events: DomainEventLogger,
}

impl FeeGenerationService {
    pub fn new(pool: PgPool) -> Self {
        let events = DomainEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Units that receive fees: active and not archived. An optional
    /// subset restricts targeting for extra fees.
    async fn fee_units(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        subset: &[Uuid],
    ) -> EngineResult<Vec<UnitRow>> {
        let units: Vec<UnitRow> = if subset.is_empty() {
            sqlx::query_as(
                "SELECT id, weight FROM units
                 WHERE tenant_id = $1 AND is_active AND archived_at IS NULL
                 ORDER BY label, id",
            )
            .bind(tenant_id)
            .fetch_all(&mut **tx)
            .await?
        } else {
            let units: Vec<UnitRow> = sqlx::query_as(
                "SELECT id, weight FROM units
                 WHERE tenant_id = $1 AND is_active AND archived_at IS NULL AND id = ANY($2)
                 ORDER BY label, id",
            )
            .bind(tenant_id)
            .bind(subset)
            .fetch_all(&mut **tx)
            .await?;
            if units.len() != subset.len() {
                return Err(EngineError::Validation(format!(
                    "unit subset names {} units but {} are billable for tenant {tenant_id}",
                    subset.len(),
                    units.len()
                )));
            }
            units
        };
        Ok(units)
    }

    async fn fee_exists(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        unit_id: Uuid,
        year: i32,
        month: u8,
        kind: FeeKind,
        label: &str,
    ) -> EngineResult<bool> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM fees
             WHERE tenant_id = $1 AND unit_id = $2 AND year = $3 AND month = $4
               AND fee_kind = $5 AND label = $6",
        )
        .bind(tenant_id)
        .bind(unit_id)
        .bind(year)
        .bind(i32::from(month))
        .bind(kind.as_str())
        .bind(label)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(existing.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_fee(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        unit_id: Uuid,
        year: i32,
        month: u8,
        kind: FeeKind,
        label: &str,
        amount: Decimal,
        due_date: Date,
        reference: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fees
                (tenant_id, unit_id, year, month, fee_kind, label, amount, due_date, status, reference)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tenant_id)
        .bind(unit_id)
        .bind(year)
        .bind(i32::from(month))
        .bind(kind.as_str())
        .bind(label)
        .bind(amount)
        .bind(due_date)
        .bind(FeeStatus::Pending.as_str())
        .bind(reference)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Generate the regular monthly fees of one tenant from its approved
    /// annual budget. One fee per billable unit, keyed by
    /// (tenant, unit, year, month); existing keys are skipped.
    pub async fn generate_regular_fees(
        &self,
        tenant_id: Uuid,
        year: i32,
        month: u8,
        dry_run: bool,
    ) -> EngineResult<GenerationReport> {
        if !(1..=12).contains(&month) {
            return Err(EngineError::Validation(format!(
                "month {month} out of range"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let approved = budget::get_approved_budget(&mut tx, tenant_id, year).await?;
        let monthly_total = approved.total_revenue / Decimal::from(12);
        let due_date = due_date_for(year, month)?;

        let units = Self::fee_units(&mut tx, tenant_id, &[]).await?;
        let mut report = GenerationReport::new(tenant_id, dry_run);
        if units.is_empty() {
            tracing::info!(tenant_id = %tenant_id, "No billable units, nothing to generate");
            return Ok(report);
        }

        let weights: Vec<i64> = units.iter().map(|u| i64::from(u.weight)).collect();
        if weights.iter().sum::<i64>() <= 0 {
            return Err(EngineError::Validation(format!(
                "unit weights of tenant {tenant_id} sum to zero"
            )));
        }
        let amounts = distribute_by_weight(monthly_total, &weights);

        for (unit, amount) in units.iter().zip(amounts) {
            let reference =
                fee_reference(FeeKind::Regular, unit.id, Period::monthly(year, month), "");
            let outcome = if Self::fee_exists(
                &mut tx,
                tenant_id,
                unit.id,
                year,
                month,
                FeeKind::Regular,
                "",
            )
            .await?
            {
                FeeOutcome::Skipped
            } else {
                Self::insert_fee(
                    &mut tx,
                    tenant_id,
                    unit.id,
                    year,
                    month,
                    FeeKind::Regular,
                    "",
                    amount,
                    due_date,
                    &reference,
                )
                .await?;
                FeeOutcome::Created
            };
            report.push(GeneratedFee {
                unit_id: unit.id,
                year,
                month,
                reference,
                amount,
                outcome,
            });
        }

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            year = year,
            month = month,
            created = report.created,
            skipped = report.skipped,
            dry_run = dry_run,
            "Regular fee generation complete"
        );

        if !dry_run && report.created > 0 {
            if let Err(e) = self
                .events
                .log(
                    DomainEventBuilder::new(DomainEventType::FeesGenerated)
                        .tenant(tenant_id)
                        .payload(serde_json::json!({
                            "year": year,
                            "month": month,
                            "kind": FeeKind::Regular.as_str(),
                            "created": report.created,
                            "skipped": report.skipped,
                        })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log fee generation event");
            }
        }

        Ok(report)
    }

    /// Distribute a one-off amount evenly across months and, within each
    /// month, across the targeted units by weight. Idempotent per
    /// (tenant, unit, year, month, label).
    #[allow(clippy::too_many_arguments)]
    pub async fn generate_extra_fees(
        &self,
        tenant_id: Uuid,
        year: i32,
        months: &[u8],
        total_amount: Decimal,
        label: &str,
        unit_subset: &[Uuid],
        dry_run: bool,
    ) -> EngineResult<GenerationReport> {
        if months.is_empty() {
            return Err(EngineError::Validation(
                "at least one target month is required".to_string(),
            ));
        }
        if let Some(bad) = months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(EngineError::Validation(format!("month {bad} out of range")));
        }
        if total_amount <= Decimal::ZERO {
            return Err(EngineError::NonPositiveAmount(total_amount));
        }
        if label.trim().is_empty() {
            return Err(EngineError::Validation(
                "extra fees require a label".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let units = Self::fee_units(&mut tx, tenant_id, unit_subset).await?;
        let mut report = GenerationReport::new(tenant_id, dry_run);
        if units.is_empty() {
            tracing::info!(tenant_id = %tenant_id, "No billable units, nothing to generate");
            return Ok(report);
        }

        let weights: Vec<i64> = units.iter().map(|u| i64::from(u.weight)).collect();
        if weights.iter().sum::<i64>() <= 0 {
            return Err(EngineError::Validation(format!(
                "unit weights of tenant {tenant_id} sum to zero"
            )));
        }

        let per_month = total_amount / Decimal::from(months.len() as i64);
        for &month in months {
            let due_date = due_date_for(year, month)?;
            let amounts = distribute_by_weight(per_month, &weights);
            for (unit, amount) in units.iter().zip(amounts) {
                let reference =
                    fee_reference(FeeKind::Extra, unit.id, Period::monthly(year, month), label);
                let outcome = if Self::fee_exists(
                    &mut tx,
                    tenant_id,
                    unit.id,
                    year,
                    month,
                    FeeKind::Extra,
                    label,
                )
                .await?
                {
                    FeeOutcome::Skipped
                } else {
                    Self::insert_fee(
                        &mut tx,
                        tenant_id,
                        unit.id,
                        year,
                        month,
                        FeeKind::Extra,
                        label,
                        amount,
                        due_date,
                        &reference,
                    )
                    .await?;
                    FeeOutcome::Created
                };
                report.push(GeneratedFee {
                    unit_id: unit.id,
                    year,
                    month,
                    reference,
                    amount,
                    outcome,
                });
            }
        }

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            year = year,
            label = %label,
            created = report.created,
            skipped = report.skipped,
            dry_run = dry_run,
            "Extra fee generation complete"
        );

        if !dry_run && report.created > 0 {
            if let Err(e) = self
                .events
                .log(
                    DomainEventBuilder::new(DomainEventType::FeesGenerated)
                        .tenant(tenant_id)
                        .payload(serde_json::json!({
                            "year": year,
                            "months": months,
                            "kind": FeeKind::Extra.as_str(),
                            "label": label,
                            "created": report.created,
                            "skipped": report.skipped,
                        })),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log fee generation event");
            }
        }

        Ok(report)
    }

    /// Flip pending fees past their due date to overdue. Historical fees
    /// are exempt from automated flows.
    pub async fn mark_overdue_fees(&self, today: Date, dry_run: bool) -> EngineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let flagged = sqlx::query(
            "UPDATE fees SET status = $1
             WHERE status = $2 AND due_date < $3 AND NOT is_historical",
        )
        .bind(FeeStatus::Overdue.as_str())
        .bind(FeeStatus::Pending.as_str())
        .bind(today)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        tracing::info!(flagged = flagged, dry_run = dry_run, "Overdue flagging complete");
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn standard_permillage_split_is_exact() {
        // 600.00 monthly over weights 500/300/200 out of 1000.
        let amounts = distribute_by_weight(dec!(600.00), &[500, 300, 200]);
        assert_eq!(amounts, vec![dec!(300.00), dec!(180.00), dec!(120.00)]);
    }

    #[test]
    fn rounding_drift_stays_within_one_unit_per_share() {
        let total = dec!(100.00);
        let weights = [333, 333, 334];
        let amounts = distribute_by_weight(total, &weights);
        let sum: Decimal = amounts.iter().sum();
        let drift = (sum - total).abs();
        assert!(
            drift <= dec!(0.01) * Decimal::from(weights.len() as i64),
            "drift {drift} exceeds bound"
        );
        // Each share is rounded to exactly two decimals.
        for a in &amounts {
            assert_eq!(*a, round2(*a));
        }
    }

    #[test]
    fn drift_is_not_redistributed() {
        // Three equal thirds of 100.00 each round to 33.33; the missing
        // cent stays missing.
        let amounts = distribute_by_weight(dec!(100.00), &[1, 1, 1]);
        assert_eq!(amounts, vec![dec!(33.33), dec!(33.33), dec!(33.33)]);
        let sum: Decimal = amounts.iter().sum();
        assert_eq!(sum, dec!(99.99));
    }

    #[test]
    fn half_cent_rounds_away_from_zero() {
        // 0.125 of 100.00 = 12.50; 1/8000 weights produce 0.0125 shares.
        let amounts = distribute_by_weight(dec!(0.10), &[1, 3]);
        // 0.025 -> 0.03, 0.075 -> 0.08
        assert_eq!(amounts, vec![dec!(0.03), dec!(0.08)]);
    }

    #[test]
    fn fee_reference_is_deterministic() {
        let unit = Uuid::new_v4();
        let a = fee_reference(FeeKind::Regular, unit, Period::monthly(2025, 3), "");
        let b = fee_reference(FeeKind::Regular, unit, Period::monthly(2025, 3), "");
        assert_eq!(a, b);
        assert!(a.starts_with("REG-2025-03-"));
    }

    #[test]
    fn extra_fee_reference_slugs_the_label() {
        let unit = Uuid::new_v4();
        let reference = fee_reference(
            FeeKind::Extra,
            unit,
            Period::monthly(2025, 7),
            "Roof Repair (phase 2)",
        );
        assert!(reference.starts_with("EXT-2025-07-"));
        assert!(reference.ends_with("-roof-repair-phase-2"));
    }

    #[test]
    fn annual_reference_uses_month_zero() {
        let unit = Uuid::new_v4();
        let reference = fee_reference(FeeKind::Regular, unit, Period::annual(2024), "");
        assert!(reference.starts_with("REG-2024-00-"));
    }

    #[test]
    fn due_dates_fall_on_the_tenth() {
        let due = due_date_for(2025, 3).unwrap();
        assert_eq!(due, time::macros::date!(2025 - 03 - 10));
        assert!(due_date_for(2025, 13).is_err());
    }
}
