//! Wiring shared by the API server and the worker binaries.

use crate::campaign_event_handler::CampaignEventHandler;
use crate::campaign_service::CampaignService;
use crate::circuit_breaker::{BreakerSettings, BreakerStore, CircuitBreakerService};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::db_storage::PgStore;
use crate::lifecycle::Lifecycle;
use crate::models::ThirdPartyService;
use crate::queue_manager::QueueManager;
use crate::rate_limiter::{ApiIntegrationRateLimiter, CounterStore};
use crate::redis_backend::{self, RedisBreakerStore, RedisCounterStore, RedisTaskQueue};
use crate::service_guard::ServiceGuard;
use crate::services::EmailPlatform;
use crate::store::Store;
use crate::task_queue::TaskQueue;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

/// Backends every process needs.
pub struct Backends {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub breaker_store: Arc<dyn BreakerStore>,
    pub counters: Arc<dyn CounterStore>,
    pub clock: Arc<dyn Clock>,
    /// Kept for health probes.
    pub redis: Option<ConnectionManager>,
}

impl Backends {
    /// Postgres (migrated) and Redis from the configured URLs.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let db = Database::new(&config.database_url).await?;
        db.migrate().await?;
        tracing::info!("Database connection pool established");

        let conn = redis_backend::connect(&config.redis_url).await?;
        tracing::info!("✓ Redis connection established");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            store: Arc::new(PgStore::new(db.pool)),
            queue: Arc::new(RedisTaskQueue::new(conn.clone(), clock.clone())),
            breaker_store: Arc::new(RedisBreakerStore::new(conn.clone())),
            counters: Arc::new(RedisCounterStore::new(conn.clone())),
            clock,
            redis: Some(conn),
        })
    }
}

/// The service graph built on top of [`Backends`].
pub struct Services {
    pub lifecycle: Lifecycle,
    pub breaker: Arc<CircuitBreakerService>,
    pub guard: Arc<ServiceGuard>,
    pub events: Arc<CampaignEventHandler>,
    pub queue_manager: Arc<QueueManager>,
    pub campaigns: CampaignService,
}

pub fn breaker_settings(config: &Config) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: config.circuit_failure_threshold,
        cooldown: Duration::from_secs(config.circuit_cooldown_secs),
        half_open_max_calls: config.circuit_half_open_max_calls,
    }
}

/// Builds the services and subscribes the campaign event handler to the breaker.
pub async fn build_services(
    backends: &Backends,
    settings: BreakerSettings,
    rate_limits: impl Fn(ThirdPartyService) -> crate::config::RateLimit,
    email_platform: Option<Arc<dyn EmailPlatform>>,
) -> Services {
    let lifecycle = Lifecycle::new(
        backends.store.clone(),
        backends.queue.clone(),
        backends.clock.clone(),
    );
    let breaker = Arc::new(CircuitBreakerService::new(
        backends.breaker_store.clone(),
        settings,
        backends.clock.clone(),
    ));
    let limiters = ThirdPartyService::ALL.map(|service| {
        ApiIntegrationRateLimiter::new(
            service,
            rate_limits(service),
            backends.counters.clone(),
            backends.clock.clone(),
        )
    });
    let guard = Arc::new(ServiceGuard::new(breaker.clone(), limiters));

    let events = Arc::new(CampaignEventHandler::new(
        lifecycle.clone(),
        backends.breaker_store.clone(),
        settings.failure_threshold,
    ));
    breaker.subscribe(events.clone()).await;

    let queue_manager = Arc::new(QueueManager::new(
        breaker.clone(),
        lifecycle.clone(),
        events.clone(),
    ));
    let campaigns = CampaignService::new(
        lifecycle.clone(),
        events.clone(),
        guard.clone(),
        email_platform,
    );

    Services {
        lifecycle,
        breaker,
        guard,
        events,
        queue_manager,
        campaigns,
    }
}
