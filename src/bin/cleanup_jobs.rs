//! Deletes finished jobs older than N days across all campaigns.
//!
//! Usage: `cleanup_jobs [days]` (falls back to `CLEANUP_DAYS`, then 7).

use rust_leadgen_api::bootstrap::{breaker_settings, build_services, Backends};
use rust_leadgen_api::config::Config;
use rust_leadgen_api::obs;

const DEFAULT_DAYS: i64 = 7;

fn retention_days() -> anyhow::Result<i64> {
    let raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CLEANUP_DAYS").ok());
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("days must be a whole number, got '{}'", raw)),
        None => Ok(DEFAULT_DAYS),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing("rust_leadgen_api=info,cleanup_jobs=info");

    let days = retention_days()?;
    let config = Config::from_env()?;
    let backends = Backends::connect(&config).await?;
    let services = build_services(
        &backends,
        breaker_settings(&config),
        |service| config.rate_limit(service),
        None,
    )
    .await;

    tracing::info!("🧹 Cleaning up jobs finished more than {} days ago...", days);
    let report = services.campaigns.cleanup_campaign_jobs(None, days).await?;
    tracing::info!(
        "✓ Deleted {} jobs, revoked {} queued tasks (cutoff {})",
        report.jobs_deleted, report.tasks_revoked, report.cutoff
    );
    Ok(())
}
