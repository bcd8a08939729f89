use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Third-party services ============

/// External providers the pipeline depends on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ThirdPartyService {
    Apollo,
    OpenAi,
    Instantly,
    Perplexity,
}

impl ThirdPartyService {
    pub const ALL: [ThirdPartyService; 4] = [
        ThirdPartyService::Apollo,
        ThirdPartyService::OpenAi,
        ThirdPartyService::Instantly,
        ThirdPartyService::Perplexity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThirdPartyService::Apollo => "apollo",
            ThirdPartyService::OpenAi => "openai",
            ThirdPartyService::Instantly => "instantly",
            ThirdPartyService::Perplexity => "perplexity",
        }
    }

    /// Comma separated list used in validation messages.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ThirdPartyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid service '{given}'. Valid services: {valid}")]
pub struct UnknownServiceError {
    pub given: String,
    pub valid: String,
}

impl FromStr for ThirdPartyService {
    type Err = UnknownServiceError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|service| service.as_str() == lowered)
            .ok_or_else(|| UnknownServiceError {
                given: s.to_string(),
                valid: Self::valid_names(),
            })
    }
}

// ============ Status enums ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Created => "CREATED",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FetchLeads,
    EnrichLead,
    VerifyEmails,
    GenerateEmailCopy,
    PushToInstantly,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::FetchLeads,
        JobType::EnrichLead,
        JobType::VerifyEmails,
        JobType::GenerateEmailCopy,
        JobType::PushToInstantly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FetchLeads => "FETCH_LEADS",
            JobType::EnrichLead => "ENRICH_LEAD",
            JobType::VerifyEmails => "VERIFY_EMAILS",
            JobType::GenerateEmailCopy => "GENERATE_EMAIL_COPY",
            JobType::PushToInstantly => "PUSH_TO_INSTANTLY",
        }
    }

    /// Third-party services a job of this type calls.
    pub fn services(&self) -> &'static [ThirdPartyService] {
        match self {
            JobType::FetchLeads => &[ThirdPartyService::Apollo],
            JobType::EnrichLead => &[
                ThirdPartyService::Perplexity,
                ThirdPartyService::OpenAi,
                ThirdPartyService::Instantly,
            ],
            JobType::VerifyEmails => &[],
            JobType::GenerateEmailCopy => &[ThirdPartyService::OpenAi],
            JobType::PushToInstantly => &[ThirdPartyService::Instantly],
        }
    }

    pub fn depends_on(&self, service: ThirdPartyService) -> bool {
        self.services().contains(&service)
    }

    /// Failure of a critical job fails its whole campaign.
    pub fn is_campaign_critical(&self) -> bool {
        matches!(self, JobType::FetchLeads)
    }

    pub fn is_lead_scoped(&self) -> bool {
        !matches!(self, JobType::FetchLeads)
    }

    /// Task name the job is enqueued under.
    pub fn task_name(&self) -> &'static str {
        match self {
            JobType::FetchLeads => "fetch_leads",
            JobType::EnrichLead => "enrich_lead",
            JobType::VerifyEmails => "verify_emails",
            JobType::GenerateEmailCopy => "generate_email_copy",
            JobType::PushToInstantly => "push_to_instantly",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Entities ============

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub organization_id: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalRecords")]
    pub total_records: i32,
    pub url: String,
    pub status: CampaignStatus,
    pub status_message: Option<String>,
    pub status_error: Option<String>,
    pub paused_service: Option<ThirdPartyService>,
    pub instantly_campaign_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fetch_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(request: &CreateCampaignRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            description: request.description.clone(),
            organization_id: request.organization_id.clone(),
            file_name: request.file_name.clone(),
            total_records: request.total_records,
            url: request.url.trim().to_string(),
            status: CampaignStatus::Created,
            status_message: Some("Campaign created".to_string()),
            status_error: None,
            paused_service: None,
            instantly_campaign_id: None,
            created_at: now,
            updated_at: now,
            fetch_completed_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub job_type: JobType,
    pub name: String,
    pub status: JobStatus,
    pub task_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub paused_service: Option<ThirdPartyService>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        campaign_id: Option<Uuid>,
        lead_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = match lead_id {
            Some(lead) => format!("{} lead {}", job_type.task_name(), lead),
            None => match campaign_id {
                Some(campaign) => format!("{} campaign {}", job_type.task_name(), campaign),
                None => job_type.task_name().to_string(),
            },
        };
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            lead_id,
            job_type,
            name,
            status: JobStatus::Pending,
            task_id: None,
            result: None,
            error: None,
            attempts: 0,
            paused_service: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub linkedin_url: Option<String>,
    pub dedupe_key: String,
    pub raw_data: Value,
    pub email_verified: Option<bool>,
    pub enrichment_results: Option<Value>,
    pub email_copy_gen_results: Option<Value>,
    pub instantly_lead_record: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A lead as parsed from a scraper record, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub linkedin_url: Option<String>,
    pub dedupe_key: String,
    pub raw_data: Value,
}

impl NewLead {
    pub fn into_lead(self, campaign_id: Uuid, now: DateTime<Utc>) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            campaign_id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            company: self.company,
            title: self.title,
            linkedin_url: self.linkedin_url,
            dedupe_key: self.dedupe_key,
            raw_data: self.raw_data,
            email_verified: None,
            enrichment_results: None,
            email_copy_gen_results: None,
            instantly_lead_record: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistent per-service circuit breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub service: ThirdPartyService,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_at: Option<DateTime<Utc>>,
    pub half_open_calls: u32,
    pub pause_info: Option<String>,
    /// Set by a manual pause; suppresses the automatic half-open probe.
    pub manual_override: bool,
}

impl CircuitBreakerRecord {
    pub fn closed(service: ThirdPartyService, failure_threshold: u32) -> Self {
        Self {
            service,
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold,
            opened_at: None,
            half_open_at: None,
            half_open_calls: 0,
            pause_info: None,
            manual_override: false,
        }
    }
}

// ============ Update payloads ============

/// Fields written together with a campaign status compare-and-set.
///
/// `status_message`, `status_error` and `paused_service` overwrite the stored
/// values; the timestamp fields only overwrite when `Some`.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignStatusChange {
    pub status: CampaignStatus,
    pub status_message: Option<String>,
    pub status_error: Option<String>,
    pub paused_service: Option<ThirdPartyService>,
    pub fetch_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Fields written together with a job status compare-and-set.
///
/// `paused_service` always overwrites; `result`, `error`, `attempts`
/// and `completed_at` only when `Some`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusChange {
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub attempts: Option<i32>,
    pub paused_service: Option<ThirdPartyService>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusChange {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            attempts: None,
            paused_service: None,
            completed_at: None,
        }
    }
}

/// One pipeline stage's output written back onto a lead.
#[derive(Debug, Clone, PartialEq)]
pub enum LeadStageUpdate {
    EmailVerified(bool),
    Enrichment(Value),
    EmailCopy(Value),
    InstantlyRecord(Value),
    Error(String),
}

/// Selection criteria for job queries; empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub job_types: Vec<JobType>,
    pub campaign_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub paused_service: Option<ThirdPartyService>,
    /// Only jobs without a recorded task handle.
    pub unqueued: bool,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
            && self.campaign_id.map_or(true, |id| job.campaign_id == Some(id))
            && self.lead_id.map_or(true, |id| job.lead_id == Some(id))
            && self
                .paused_service
                .map_or(true, |s| job.paused_service == Some(s))
            && (!self.unqueued || job.task_id.is_none())
    }
}

// ============ API Request/Response ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalRecords")]
    pub total_records: i32,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRequest {
    pub service: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PauseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupRequest {
    #[serde(default = "default_cleanup_days")]
    pub days: i64,
}

fn default_cleanup_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerunStageRequest {
    pub job_type: JobType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub campaign_id: Option<Uuid>,
    pub jobs_deleted: usize,
    pub tasks_revoked: usize,
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadStats {
    pub total_leads_fetched: usize,
    pub leads_with_email: usize,
    pub leads_with_verified_email: usize,
    pub leads_with_enrichment: usize,
    pub leads_with_email_copy: usize,
    pub leads_with_instantly_record: usize,
    pub leads_with_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDetails {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub jobs: Vec<Job>,
    pub lead_stats: LeadStats,
    pub valid_transitions: Vec<CampaignStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub counter_store: String,
}
