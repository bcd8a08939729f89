//! Pipeline worker: pulls job tasks from the queue and runs them.
//!
//! All four integration clients are constructed up front so a missing key
//! stops the process before any job is claimed.

use rust_leadgen_api::bootstrap::{breaker_settings, build_services, Backends};
use rust_leadgen_api::config::Config;
use rust_leadgen_api::obs;
use rust_leadgen_api::services::{ApolloService, InstantlyService, OpenAiService, PerplexityService};
use rust_leadgen_api::worker::{Integrations, JobRunner, WorkerConfig, WorkerPool};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing("rust_leadgen_api=info,worker=info");

    let config = Config::from_env()?;

    let email_platform = Arc::new(InstantlyService::new(&config)?);
    let integrations = Integrations {
        scraper: Arc::new(ApolloService::new(&config)?),
        enricher: Arc::new(PerplexityService::new(&config)?),
        copywriter: Arc::new(OpenAiService::new(&config)?),
        email_platform: email_platform.clone(),
    };
    tracing::info!("✓ Integration clients initialized");

    let backends = Backends::connect(&config).await?;
    let services = build_services(
        &backends,
        breaker_settings(&config),
        |service| config.rate_limit(service),
        Some(email_platform),
    )
    .await;

    let runner = Arc::new(JobRunner::new(
        services.lifecycle.clone(),
        services.guard.clone(),
        integrations,
        config.retry_policy(),
    ));
    let pool = WorkerPool::new(
        runner,
        backends.queue.clone(),
        WorkerConfig {
            concurrency: config.worker_concurrency,
            ..Default::default()
        },
    );

    let stats = pool
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
        })
        .await?;

    tracing::info!(
        "Worker exited after {} tasks ({} errored)",
        stats.tasks_started,
        stats.tasks_errored
    );
    Ok(())
}
