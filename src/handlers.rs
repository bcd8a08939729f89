use crate::campaign_service::CampaignService;
use crate::circuit_breaker::CircuitStatusSnapshot;
use crate::errors::AppError;
use crate::models::*;
use crate::queue_manager::{PausedLead, QueueManager, QueueStatus, ServiceActionReport};
use crate::redis_backend;
use crate::store::Store;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use moka::future::Cache;
use redis::aio::ConnectionManager;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const QUEUE_STATUS_KEY: &str = "queue-status";
const DEFAULT_PAUSE_REASON: &str = "Paused by operator";

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub campaigns: CampaignService,
    pub queue_manager: Arc<QueueManager>,
    /// Relational store, probed by the health check.
    pub store: Arc<dyn Store>,
    /// Shared counter store connection, probed by the health check.
    pub redis: Option<ConnectionManager>,
    /// Short-lived queue status snapshot; dropped on every service action.
    pub queue_status_cache: Cache<&'static str, QueueStatus>,
}

impl AppState {
    pub fn new(
        campaigns: CampaignService,
        queue_manager: Arc<QueueManager>,
        store: Arc<dyn Store>,
        redis: Option<ConnectionManager>,
    ) -> Self {
        Self {
            campaigns,
            queue_manager,
            store,
            redis,
            queue_status_cache: Cache::builder()
                .time_to_live(Duration::from_secs(5))
                .max_capacity(1)
                .build(),
        }
    }

    async fn invalidate_queue_status(&self) {
        self.queue_status_cache.invalidate(QUEUE_STATUS_KEY).await;
    }
}

/// Case-insensitive service name from a path or body.
fn parse_service(raw: &str) -> Result<ThirdPartyService, AppError> {
    raw.parse::<ThirdPartyService>()
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Health check endpoint.
///
/// Reports the service name and version plus the reachability of the
/// relational store and the counter store. Always HTTP 200 so the platform
/// health probe does not restart the process on a dependency blip.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let database = match state.store.ping().await {
        Ok(()) => "connected".to_string(),
        Err(e) => {
            tracing::warn!("Health check: database unreachable: {}", e);
            "unreachable".to_string()
        }
    };
    let counter_store = match &state.redis {
        Some(conn) => match redis_backend::ping(conn).await {
            Ok(()) => "connected".to_string(),
            Err(e) => {
                tracing::warn!("Health check: redis unreachable: {}", e);
                "unreachable".to_string()
            }
        },
        None => "in-memory".to_string(),
    };
    let status = if database == "unreachable" || counter_store == "unreachable" {
        "degraded"
    } else {
        "healthy"
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            database,
            counter_store,
        }),
    )
}

// ============ Campaigns ============

/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), AppError> {
    tracing::info!("POST /campaigns - name: {}", request.name);
    let campaign = state.campaigns.create_campaign(&request).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /api/v1/campaigns/:id
///
/// Campaign row with its jobs, lead statistics and the statuses it may move to next.
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignDetails>, AppError> {
    Ok(Json(state.campaigns.get_campaign_details(id).await?))
}

/// POST /api/v1/campaigns/:id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    tracing::info!("POST /campaigns/{}/start", id);
    Ok(Json(state.campaigns.start_campaign(id).await?))
}

/// POST /api/v1/campaigns/:id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<Campaign>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string());
    tracing::info!("POST /campaigns/{}/pause - reason: {}", id, reason);
    let campaign = state.campaigns.pause_campaign(id, &reason).await?;
    state.invalidate_queue_status().await;
    Ok(Json(campaign))
}

/// POST /api/v1/campaigns/:id/resume
///
/// Refused with 409 while a service the campaign depends on is still OPEN.
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, AppError> {
    tracing::info!("POST /campaigns/{}/resume", id);
    let campaign = state.campaigns.resume_campaign(id).await?;
    state.invalidate_queue_status().await;
    Ok(Json(campaign))
}

/// POST /api/v1/campaigns/:id/cleanup
pub async fn cleanup_campaign_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupReport>, AppError> {
    tracing::info!("POST /campaigns/{}/cleanup - days: {}", id, request.days);
    Ok(Json(
        state
            .campaigns
            .cleanup_campaign_jobs(Some(id), request.days)
            .await?,
    ))
}

/// GET /api/v1/campaigns/:id/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadStats>, AppError> {
    Ok(Json(state.campaigns.get_campaign_lead_stats(id).await?))
}

/// GET /api/v1/campaigns/:id/analytics
pub async fn get_campaign_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(state.campaigns.get_campaign_analytics(id).await?))
}

// ============ Jobs & leads ============

/// POST /api/v1/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    tracing::info!("POST /jobs/{}/cancel", id);
    Ok(Json(state.campaigns.cancel_job(id).await?))
}

/// POST /api/v1/leads/:id/jobs
///
/// Queues a single pipeline stage for one lead (recovery after a partial failure).
pub async fn create_lead_job(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(request): Json<RerunStageRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    tracing::info!("POST /leads/{}/jobs - type: {}", lead_id, request.job_type);
    let job = state
        .campaigns
        .create_lead_job(lead_id, request.job_type)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

// ============ Queue management ============

/// GET /api/v1/queue-management/status
pub async fn get_queue_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueStatus>, AppError> {
    if let Some(cached) = state.queue_status_cache.get(QUEUE_STATUS_KEY).await {
        tracing::debug!("Queue status served from cache");
        return Ok(Json(cached));
    }
    let status = state.queue_manager.get_queue_status().await?;
    state
        .queue_status_cache
        .insert(QUEUE_STATUS_KEY, status.clone())
        .await;
    Ok(Json(status))
}

/// POST /api/v1/queue-management/pause-service
///
/// Forces the service's circuit OPEN and pauses every job and campaign that depends on it.
pub async fn pause_service(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ServiceRequest>,
) -> Result<Json<ServiceActionReport>, AppError> {
    let service = parse_service(&request.service)?;
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string());
    tracing::info!("POST /queue-management/pause-service - {} ({})", service, reason);
    let report = state
        .queue_manager
        .pause_jobs_for_service(service, &reason)
        .await?;
    state.invalidate_queue_status().await;
    Ok(Json(report))
}

/// POST /api/v1/queue-management/resume-service
pub async fn resume_service(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ServiceRequest>,
) -> Result<Json<ServiceActionReport>, AppError> {
    let service = parse_service(&request.service)?;
    tracing::info!("POST /queue-management/resume-service - {}", service);
    let report = state.queue_manager.resume_jobs_for_service(service).await?;
    state.invalidate_queue_status().await;
    Ok(Json(report))
}

/// GET /api/v1/queue-management/paused-jobs/:service
pub async fn get_paused_jobs(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Vec<Job>>, AppError> {
    let service = parse_service(&service)?;
    Ok(Json(
        state.queue_manager.get_paused_jobs_by_service(service).await?,
    ))
}

/// GET /api/v1/queue-management/paused-leads/:service
pub async fn get_paused_leads(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Vec<PausedLead>>, AppError> {
    let service = parse_service(&service)?;
    Ok(Json(
        state
            .queue_manager
            .get_paused_leads_for_recovery(service)
            .await?,
    ))
}

/// GET /api/v1/queue-management/circuit-breakers
pub async fn get_circuit_breakers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CircuitStatusSnapshot>, AppError> {
    Ok(Json(state.queue_manager.get_circuit_breakers().await?))
}

/// GET /api/v1/queue-management/campaigns/:service
pub async fn get_paused_campaigns(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Vec<Campaign>>, AppError> {
    let service = parse_service(&service)?;
    Ok(Json(
        state
            .queue_manager
            .get_paused_campaigns_for_service(service)
            .await?,
    ))
}

/// POST /api/v1/queue-management/campaigns/:service/pause
pub async fn pause_service_campaigns(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<Value>, AppError> {
    let service = parse_service(&service)?;
    let reason = body
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string());
    let paused = state
        .queue_manager
        .pause_campaigns_for_service(service, &reason)
        .await?;
    state.invalidate_queue_status().await;
    Ok(Json(json!({
        "service": service,
        "campaigns_paused": paused,
        "message": format!("Paused {} campaigns for {} service", paused, service),
    })))
}

/// POST /api/v1/queue-management/campaigns/:service/resume
pub async fn resume_service_campaigns(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Value>, AppError> {
    let service = parse_service(&service)?;
    let resumed = state
        .queue_manager
        .resume_campaigns_for_service(service)
        .await?;
    state.invalidate_queue_status().await;
    Ok(Json(json!({
        "service": service,
        "campaigns_resumed": resumed,
        "message": format!("Resumed {} campaigns for {} service", resumed, service),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_is_case_insensitive() {
        assert_eq!(parse_service("OpenAI").unwrap(), ThirdPartyService::OpenAi);
        assert_eq!(parse_service(" apollo ").unwrap(), ThirdPartyService::Apollo);
    }

    #[test]
    fn test_parse_service_lists_valid_names() {
        match parse_service("mailchimp") {
            Err(AppError::BadRequest(msg)) => {
                assert!(msg.contains("mailchimp"));
                assert!(msg.contains("apollo, openai, instantly, perplexity"));
            }
            other => panic!("expected bad request, got {:?}", other.map(|s| s.to_string())),
        }
    }
}
