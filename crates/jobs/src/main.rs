//! CondoLedger Batch Jobs
//!
//! One-shot jobs invoked by external cron:
//! - Regular fee generation from approved budgets
//! - License usage recalculation
//! - Subscription expiry (period end / trial end)
//! - Overdue flagging of unpaid fees
//! - Invariant verification with optional repair
//!
//! Every mutating job accepts `--dry-run`, prints per-entity outcome lines
//! and a summary, and exits non-zero if any per-entity error occurred.

use std::future::Future;
use std::time::Duration;

use clap::{Parser, Subcommand};
use condoledger_engine::{AccountingEngine, EngineError, EngineResult};
use sqlx::postgres::PgPoolOptions;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "condoledger-jobs")]
#[command(version)]
#[command(about = "CondoLedger batch jobs", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate regular monthly fees for tenants with an approved budget
    GenerateFees {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        month: u8,
        /// Restrict to a single tenant
        #[arg(long)]
        tenant: Option<Uuid>,
        /// Compute and report without committing
        #[arg(long)]
        dry_run: bool,
    },
    /// Recalculate the cached license usage of subscriptions
    Recalculate {
        /// Restrict to a single subscription
        #[arg(long)]
        subscription: Option<Uuid>,
        /// Report stale caches without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Expire subscriptions past their period end or trial end
    ExpireSubscriptions {
        /// List candidates without expiring them
        #[arg(long)]
        dry_run: bool,
    },
    /// Flag pending fees past their due date as overdue
    MarkOverdue {
        /// Count candidates without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Run accounting invariant checks
    Verify {
        /// Run a single named check instead of all of them
        #[arg(long)]
        check: Option<String>,
        /// Apply safe auto-corrections, then re-check
        #[arg(long)]
        fix: bool,
    },
}

/// Per-entity outcome counts of one job run.
#[derive(Default)]
struct JobSummary {
    processed: usize,
    changed: usize,
    skipped: usize,
    errors: Vec<String>,
}

impl JobSummary {
    fn print(&self, job: &str) {
        println!(
            "{job}: {} processed, {} changed, {} skipped, {} errors",
            self.processed,
            self.changed,
            self.skipped,
            self.errors.len()
        );
        for error in &self.errors {
            println!("  error: {error}");
        }
    }
}

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Bounded retries with backoff on lock contention; business-rule errors
/// come back untouched on the first attempt.
async fn with_retry<T, F, Fut>(op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(3);
    RetryIf::spawn(strategy, op, |e: &EngineError| e.is_retryable()).await
}

async fn generate_fees(
    engine: &AccountingEngine,
    year: i32,
    month: u8,
    tenant: Option<Uuid>,
    dry_run: bool,
) -> anyhow::Result<JobSummary> {
    let tenants = match tenant {
        Some(tenant_id) => vec![tenant_id],
        None => engine.budget.tenants_with_approved_budget(year).await?,
    };
    let suffix = if dry_run { " (dry-run)" } else { "" };

    let mut summary = JobSummary::default();
    for tenant_id in tenants {
        match with_retry(|| engine.fees.generate_regular_fees(tenant_id, year, month, dry_run))
            .await
        {
            Ok(report) => {
                summary.processed += 1;
                summary.changed += report.created;
                summary.skipped += report.skipped;
                println!(
                    "tenant {tenant_id}: {} created, {} skipped{suffix}",
                    report.created, report.skipped
                );
            }
            Err(EngineError::BudgetNotApproved { .. }) => {
                summary.processed += 1;
                summary.skipped += 1;
                println!("tenant {tenant_id}: skipped, no approved budget for {year}");
            }
            Err(e) => {
                summary.processed += 1;
                summary.errors.push(format!("tenant {tenant_id}: {e}"));
            }
        }
    }
    Ok(summary)
}

async fn recalculate(
    engine: &AccountingEngine,
    pool: &sqlx::PgPool,
    subscription: Option<Uuid>,
    dry_run: bool,
) -> anyhow::Result<JobSummary> {
    let subscriptions: Vec<Uuid> = match subscription {
        Some(id) => vec![id],
        None => {
            sqlx::query_scalar(
                "SELECT id FROM subscriptions
                 WHERE status IN ('trial', 'active', 'suspended')
                 ORDER BY id",
            )
            .fetch_all(pool)
            .await?
        }
    };

    let mut summary = JobSummary::default();
    for id in subscriptions {
        summary.processed += 1;
        if dry_run {
            match engine.ledger.preview_usage(id).await {
                Ok(preview) if preview.is_stale() => {
                    summary.changed += 1;
                    println!(
                        "subscription {id}: would update used_licenses {} -> {} (dry-run)",
                        preview.cached, preview.expected
                    );
                }
                Ok(_) => {
                    summary.skipped += 1;
                    println!("subscription {id}: up to date (dry-run)");
                }
                Err(e) => summary.errors.push(format!("subscription {id}: {e}")),
            }
        } else {
            match with_retry(|| engine.ledger.recalculate(id)).await {
                Ok(used) => {
                    summary.changed += 1;
                    println!("subscription {id}: used_licenses = {used}");
                }
                Err(e) => summary.errors.push(format!("subscription {id}: {e}")),
            }
        }
    }
    Ok(summary)
}

async fn expire_subscriptions(
    engine: &AccountingEngine,
    pool: &sqlx::PgPool,
    dry_run: bool,
) -> anyhow::Result<JobSummary> {
    let candidates: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM subscriptions
         WHERE (status = 'active' AND current_period_end IS NOT NULL AND current_period_end < NOW())
            OR (status = 'trial' AND trial_ends_at IS NOT NULL AND trial_ends_at < NOW())
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut summary = JobSummary::default();
    for id in candidates {
        summary.processed += 1;
        if dry_run {
            summary.changed += 1;
            println!("subscription {id}: would expire (dry-run)");
            continue;
        }
        match with_retry(|| engine.ledger.expire_subscription(id)).await {
            Ok(()) => {
                summary.changed += 1;
                println!("subscription {id}: expired");
            }
            Err(e) => summary.errors.push(format!("subscription {id}: {e}")),
        }
    }
    Ok(summary)
}

async fn mark_overdue(engine: &AccountingEngine, dry_run: bool) -> anyhow::Result<JobSummary> {
    let today = time::OffsetDateTime::now_utc().date();
    let suffix = if dry_run { " (dry-run)" } else { "" };

    let mut summary = JobSummary::default();
    match engine.fees.mark_overdue_fees(today, dry_run).await {
        Ok(flagged) => {
            summary.processed = flagged as usize;
            summary.changed = flagged as usize;
            println!("{flagged} fees flagged overdue{suffix}");
        }
        Err(e) => summary.errors.push(format!("overdue flagging: {e}")),
    }
    Ok(summary)
}

async fn verify(
    engine: &AccountingEngine,
    check: Option<String>,
    fix: bool,
) -> anyhow::Result<JobSummary> {
    let violations = match &check {
        Some(name) => {
            if !condoledger_engine::InvariantChecker::available_checks().contains(&name.as_str()) {
                anyhow::bail!(
                    "unknown check '{name}'; available: {}",
                    condoledger_engine::InvariantChecker::available_checks().join(", ")
                );
            }
            engine.invariants.run_check(name).await?
        }
        None => {
            let summary = engine.invariants.run_all_checks().await?;
            println!(
                "{} checks run, {} passed, {} failed",
                summary.checks_run, summary.checks_passed, summary.checks_failed
            );
            summary.violations
        }
    };

    for violation in &violations {
        println!(
            "[{}] {}: {} ({})",
            violation.severity, violation.invariant, violation.description, violation.context
        );
    }

    let mut summary = JobSummary {
        processed: violations.len(),
        ..JobSummary::default()
    };

    if violations.is_empty() {
        println!("all invariants hold");
        return Ok(summary);
    }

    if fix {
        let fixes = engine
            .invariants
            .fix_violations(&engine.ledger, &violations)
            .await?;
        for detail in &fixes.details {
            println!("  fix: {detail}");
        }
        summary.changed = fixes.fixed;

        // Re-check so the exit code reflects what is still broken.
        let remaining = match &check {
            Some(name) => engine.invariants.run_check(name).await?,
            None => engine.invariants.run_all_checks().await?.violations,
        };
        for violation in &remaining {
            summary.errors.push(format!(
                "[{}] {}: {}",
                violation.severity, violation.invariant, violation.description
            ));
        }
    } else {
        for violation in &violations {
            summary.errors.push(format!(
                "[{}] {}: {}",
                violation.severity, violation.invariant, violation.description
            ));
        }
    }

    Ok(summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let pool = create_db_pool(&cli.database_url).await?;
    let engine = AccountingEngine::new(pool.clone());

    let (job, summary) = match cli.command {
        Command::GenerateFees {
            year,
            month,
            tenant,
            dry_run,
        } => (
            "generate-fees",
            generate_fees(&engine, year, month, tenant, dry_run).await?,
        ),
        Command::Recalculate {
            subscription,
            dry_run,
        } => (
            "recalculate",
            recalculate(&engine, &pool, subscription, dry_run).await?,
        ),
        Command::ExpireSubscriptions { dry_run } => (
            "expire-subscriptions",
            expire_subscriptions(&engine, &pool, dry_run).await?,
        ),
        Command::MarkOverdue { dry_run } => ("mark-overdue", mark_overdue(&engine, dry_run).await?),
        Command::Verify { check, fix } => ("verify", verify(&engine, check, fix).await?),
    };

    summary.print(job);
    if !summary.errors.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
