//! Campaign state machine, input validation and progress evaluation.
//!
//! ```text
//! CREATED ──start──▶ RUNNING ──all jobs terminal──▶ COMPLETED
//!    │                │   ▲
//!    │                │   └──resume── PAUSED
//!    │                └──pause──────▶   │
//!    └────────fail────────▶ FAILED ◀────┘
//! ```

use crate::models::{
    Campaign, CampaignStatus, CampaignStatusChange, Job, JobStatus, JobType, ThirdPartyService,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Largest lead count one campaign may request.
pub const MAX_TOTAL_RECORDS: i32 = 1000;
const APOLLO_SEARCH_PREFIX: &str = "https://app.apollo.io/";

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    /// Statuses reachable from this one, excluding self-transitions.
    pub fn valid_transitions(&self) -> Vec<CampaignStatus> {
        [
            CampaignStatus::Created,
            CampaignStatus::Running,
            CampaignStatus::Paused,
            CampaignStatus::Completed,
            CampaignStatus::Failed,
        ]
        .into_iter()
        .filter(|next| next != self && self.can_transition_to(*next))
        .collect()
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Running, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignTransition {
    Start,
    Pause {
        service: ThirdPartyService,
        reason: String,
    },
    /// Operator pause; not tied to any service so breaker recovery never resumes it.
    ManualPause { reason: String },
    Resume {
        recovered: Option<ThirdPartyService>,
    },
    /// Stays PAUSED, now waiting on a different service.
    Blocked { waiting_on: ThirdPartyService },
    FetchCompleted { lead_count: usize },
    Complete { summary: String },
    Fail { error: String },
}

impl CampaignTransition {
    pub fn target(&self, current: CampaignStatus) -> CampaignStatus {
        match self {
            CampaignTransition::Start | CampaignTransition::Resume { .. } => {
                CampaignStatus::Running
            }
            CampaignTransition::Pause { .. }
            | CampaignTransition::ManualPause { .. }
            | CampaignTransition::Blocked { .. } => CampaignStatus::Paused,
            CampaignTransition::FetchCompleted { .. } => current,
            CampaignTransition::Complete { .. } => CampaignStatus::Completed,
            CampaignTransition::Fail { .. } => CampaignStatus::Failed,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            CampaignTransition::Start => "start",
            CampaignTransition::Pause { .. } | CampaignTransition::ManualPause { .. } => "pause",
            CampaignTransition::Resume { .. } => "resume",
            CampaignTransition::Blocked { .. } => "re-block",
            CampaignTransition::FetchCompleted { .. } => "record fetch results for",
            CampaignTransition::Complete { .. } => "complete",
            CampaignTransition::Fail { .. } => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {action} campaign in status {from}")]
pub struct TransitionError {
    pub from: CampaignStatus,
    pub action: &'static str,
}

/// Computes the row change for `transition`, or an error if the current status forbids it.
pub fn plan_transition(
    campaign: &Campaign,
    transition: &CampaignTransition,
    now: DateTime<Utc>,
) -> Result<CampaignStatusChange, TransitionError> {
    let from = campaign.status;
    let target = transition.target(from);
    let allowed = match transition {
        CampaignTransition::Start => from == CampaignStatus::Created,
        CampaignTransition::Blocked { .. } => from == CampaignStatus::Paused,
        CampaignTransition::FetchCompleted { .. } => {
            matches!(from, CampaignStatus::Running | CampaignStatus::Paused)
        }
        _ => from != target && from.can_transition_to(target),
    };
    if !allowed {
        return Err(TransitionError {
            from,
            action: transition.action(),
        });
    }

    let mut change = CampaignStatusChange {
        status: target,
        status_message: campaign.status_message.clone(),
        status_error: campaign.status_error.clone(),
        paused_service: None,
        fetch_completed_at: None,
        completed_at: None,
        failed_at: None,
    };

    match transition {
        CampaignTransition::Start => {
            change.status_message = Some("Campaign started, fetching leads".to_string());
            change.status_error = None;
        }
        CampaignTransition::Pause { service, reason } => {
            change.status_message = Some(format!(
                "Paused: {} service unavailable - {}",
                service, reason
            ));
            change.paused_service = Some(*service);
        }
        CampaignTransition::ManualPause { reason } => {
            change.status_message = Some(format!("Paused manually: {}", reason));
        }
        CampaignTransition::Resume { recovered } => {
            change.status_message = Some(match recovered {
                Some(service) => format!("Resumed after {} recovered", service),
                None => "Campaign resumed".to_string(),
            });
        }
        CampaignTransition::Blocked { waiting_on } => {
            change.status_message = Some(format!(
                "Paused: waiting for {} service to recover",
                waiting_on
            ));
            change.paused_service = Some(*waiting_on);
        }
        CampaignTransition::FetchCompleted { lead_count } => {
            change.paused_service = campaign.paused_service;
            if from == CampaignStatus::Running {
                change.status_message = Some(format!("Fetched {} leads", lead_count));
            }
            change.fetch_completed_at = Some(now);
        }
        CampaignTransition::Complete { summary } => {
            change.status_message = Some(summary.clone());
            change.completed_at = Some(now);
        }
        CampaignTransition::Fail { error } => {
            change.status_message = Some("Campaign failed".to_string());
            change.status_error = Some(error.clone());
            change.failed_at = Some(now);
        }
    }

    Ok(change)
}

// ============ Validation ============

fn forbidden_url_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[<>{}|\\^~\[\]`]").expect("static pattern"))
}

/// Accepts only Apollo people-search URLs without characters that break the scraper.
pub fn validate_search_url(raw: &str) -> Result<(), String> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return Err("Search URL is required".to_string());
    }
    if !candidate.starts_with(APOLLO_SEARCH_PREFIX) {
        return Err(format!("Search URL must start with {}", APOLLO_SEARCH_PREFIX));
    }
    if forbidden_url_chars().is_match(candidate) {
        return Err("Search URL contains invalid characters".to_string());
    }
    url::Url::parse(candidate).map_err(|e| format!("Search URL is malformed: {}", e))?;
    Ok(())
}

pub fn validate_count(count: i32) -> Result<(), String> {
    if count <= 0 {
        return Err("totalRecords must be greater than 0".to_string());
    }
    if count > MAX_TOTAL_RECORDS {
        return Err(format!(
            "totalRecords cannot exceed {}",
            MAX_TOTAL_RECORDS
        ));
    }
    Ok(())
}

// ============ Progress ============

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignProgress {
    pub fetch_status: Option<JobStatus>,
    pub non_terminal: usize,
    pub lead_jobs: usize,
    pub lead_jobs_completed: usize,
    pub lead_jobs_failed: usize,
}

pub fn summarize_jobs(jobs: &[Job]) -> CampaignProgress {
    let mut progress = CampaignProgress::default();
    for job in jobs {
        if !job.status.is_terminal() {
            progress.non_terminal += 1;
        }
        if job.job_type == JobType::FetchLeads {
            // Latest fetch wins; jobs arrive ordered by creation time.
            progress.fetch_status = Some(job.status);
            continue;
        }
        progress.lead_jobs += 1;
        match job.status {
            JobStatus::Completed => progress.lead_jobs_completed += 1,
            JobStatus::Failed => progress.lead_jobs_failed += 1,
            _ => {}
        }
    }
    progress
}

/// A RUNNING campaign completes once its fetch finished and nothing is left in flight.
pub fn completion_transition(
    campaign: &Campaign,
    progress: &CampaignProgress,
) -> Option<CampaignTransition> {
    if campaign.status != CampaignStatus::Running
        || campaign.fetch_completed_at.is_none()
        || progress.non_terminal > 0
    {
        return None;
    }
    Some(CampaignTransition::Complete {
        summary: format!(
            "Processed {} lead jobs: {} completed, {} failed",
            progress.lead_jobs, progress.lead_jobs_completed, progress.lead_jobs_failed
        ),
    })
}

/// Services a campaign still needs: those of its non-terminal jobs, or the
/// whole pipeline when none are in flight.
pub fn campaign_dependencies(jobs: &[Job]) -> BTreeSet<ThirdPartyService> {
    let deps: BTreeSet<ThirdPartyService> = jobs
        .iter()
        .filter(|j| !j.status.is_terminal())
        .flat_map(|j| j.job_type.services().iter().copied())
        .collect();
    if deps.is_empty() && !jobs.iter().any(|j| !j.status.is_terminal()) {
        return ThirdPartyService::ALL.into_iter().collect();
    }
    deps
}
