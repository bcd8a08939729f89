use axum::{
    routing::{get, post},
    Router,
};
use rust_leadgen_api::bootstrap::{breaker_settings, build_services, Backends};
use rust_leadgen_api::config::Config;
use rust_leadgen_api::handlers::{self, AppState};
use rust_leadgen_api::obs;
use rust_leadgen_api::services::{EmailPlatform, InstantlyService};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Operator API server.
///
/// Connects the stores, wires the breaker, limiters and lifecycle services,
/// subscribes the campaign event handler to breaker transitions and serves
/// the campaign and queue-management routes.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing("rust_leadgen_api=debug,tower_http=debug");

    let config = Config::from_env()?;
    let backends = Backends::connect(&config).await?;

    // The API only needs the email platform for campaign registration and analytics.
    let email_platform: Option<Arc<dyn EmailPlatform>> = match InstantlyService::new(&config) {
        Ok(client) => {
            tracing::info!("✓ Instantly client initialized: {}", config.instantly_base_url);
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!("Instantly client unavailable, continuing without it: {}", e);
            None
        }
    };

    let services = build_services(
        &backends,
        breaker_settings(&config),
        |service| config.rate_limit(service),
        email_platform,
    )
    .await;

    let app_state = Arc::new(AppState::new(
        services.campaigns,
        services.queue_manager,
        backends.store.clone(),
        backends.redis.clone(),
    ));

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        // Campaigns
        .route("/api/v1/campaigns", post(handlers::create_campaign))
        .route("/api/v1/campaigns/:id", get(handlers::get_campaign))
        .route("/api/v1/campaigns/:id/start", post(handlers::start_campaign))
        .route("/api/v1/campaigns/:id/pause", post(handlers::pause_campaign))
        .route("/api/v1/campaigns/:id/resume", post(handlers::resume_campaign))
        .route(
            "/api/v1/campaigns/:id/cleanup",
            post(handlers::cleanup_campaign_jobs),
        )
        .route("/api/v1/campaigns/:id/stats", get(handlers::get_campaign_stats))
        .route(
            "/api/v1/campaigns/:id/analytics",
            get(handlers::get_campaign_analytics),
        )
        // Jobs and leads
        .route("/api/v1/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/api/v1/leads/:id/jobs", post(handlers::create_lead_job))
        // Queue management
        .route(
            "/api/v1/queue-management/status",
            get(handlers::get_queue_status),
        )
        .route(
            "/api/v1/queue-management/pause-service",
            post(handlers::pause_service),
        )
        .route(
            "/api/v1/queue-management/resume-service",
            post(handlers::resume_service),
        )
        .route(
            "/api/v1/queue-management/paused-jobs/:service",
            get(handlers::get_paused_jobs),
        )
        .route(
            "/api/v1/queue-management/paused-leads/:service",
            get(handlers::get_paused_leads),
        )
        .route(
            "/api/v1/queue-management/circuit-breakers",
            get(handlers::get_circuit_breakers),
        )
        .route(
            "/api/v1/queue-management/campaigns/:service",
            get(handlers::get_paused_campaigns),
        )
        .route(
            "/api/v1/queue-management/campaigns/:service/pause",
            post(handlers::pause_service_campaigns),
        )
        .route(
            "/api/v1/queue-management/campaigns/:service/resume",
            post(handlers::resume_service_campaigns),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
