//! Campaign operations behind the operator API.

use crate::campaign_event_handler::{CampaignEventHandler, Resumability};
use crate::campaign_lifecycle::{validate_count, validate_search_url, CampaignTransition};
use crate::errors::AppError;
use crate::lifecycle::Lifecycle;
use crate::models::{
    Campaign, CampaignDetails, CampaignStatus, CleanupReport, CreateCampaignRequest, Job,
    JobFilter, JobStatus, JobType, LeadStats, ThirdPartyService,
};
use crate::service_guard::ServiceGuard;
use crate::services::EmailPlatform;
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Statuses whose jobs may be deleted by cleanup.
const CLEANABLE: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

#[derive(Clone)]
pub struct CampaignService {
    lifecycle: Lifecycle,
    events: Arc<CampaignEventHandler>,
    guard: Arc<ServiceGuard>,
    email_platform: Option<Arc<dyn EmailPlatform>>,
}

impl CampaignService {
    pub fn new(
        lifecycle: Lifecycle,
        events: Arc<CampaignEventHandler>,
        guard: Arc<ServiceGuard>,
        email_platform: Option<Arc<dyn EmailPlatform>>,
    ) -> Self {
        Self {
            lifecycle,
            events,
            guard,
            email_platform,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn get_campaign(&self, id: Uuid) -> Result<Campaign, AppError> {
        self.lifecycle
            .store()
            .get_campaign(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))
    }

    /// Validates and stores a CREATED campaign, then registers it with the
    /// email platform when one is configured. Platform failures are logged only.
    pub async fn create_campaign(
        &self,
        request: &CreateCampaignRequest,
    ) -> Result<Campaign, AppError> {
        if request.name.trim().is_empty() {
            return Err(AppError::BadRequest("name is required".to_string()));
        }
        if request.file_name.trim().is_empty() {
            return Err(AppError::BadRequest("fileName is required".to_string()));
        }
        if request.total_records < 0 {
            return Err(AppError::BadRequest(
                "totalRecords cannot be negative".to_string(),
            ));
        }
        let store = self.lifecycle.store();
        if let Some(organization_id) = &request.organization_id {
            if !store.organization_exists(organization_id).await? {
                return Err(AppError::NotFound(format!(
                    "Organization {} not found",
                    organization_id
                )));
            }
        }

        let mut campaign = Campaign::new(request, self.lifecycle.clock().now());
        store.insert_campaign(&campaign).await?;
        tracing::info!(campaign_id = %campaign.id, name = %campaign.name, "✓ Campaign created");

        if let Some(platform) = &self.email_platform {
            let name = campaign.name.clone();
            match self
                .guard
                .call(ThirdPartyService::Instantly, || platform.create_campaign(&name))
                .await
            {
                Ok(external_id) => {
                    store
                        .set_instantly_campaign_id(campaign.id, &external_id)
                        .await?;
                    campaign.instantly_campaign_id = Some(external_id);
                }
                Err(e) => tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Failed to create Instantly campaign"
                ),
            }
        }
        Ok(campaign)
    }

    /// CREATED -> RUNNING and one FETCH_LEADS job.
    ///
    /// Parameters are validated before anything is written, so a rejected
    /// start leaves the campaign untouched.
    pub async fn start_campaign(&self, id: Uuid) -> Result<Campaign, AppError> {
        let campaign = self.get_campaign(id).await?;
        if campaign.status != CampaignStatus::Created {
            return Err(AppError::Conflict(format!(
                "Cannot start campaign in status {}",
                campaign.status
            )));
        }
        validate_count(campaign.total_records).map_err(AppError::BadRequest)?;
        validate_search_url(&campaign.url).map_err(AppError::BadRequest)?;

        let running = self
            .lifecycle
            .transition_campaign(&campaign, CampaignTransition::Start)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("Campaign {} changed concurrently", id)))?;

        // Only fails when the row could not be written; an unreachable queue
        // leaves the job PENDING for the worker sweep.
        if let Err(e) = self
            .lifecycle
            .create_job(JobType::FetchLeads, Some(id), None)
            .await
        {
            tracing::error!(campaign_id = %id, error = %e, "Failed to create fetch job");
            self.lifecycle
                .transition_campaign(
                    &running,
                    CampaignTransition::Fail {
                        error: format!("Failed to create fetch job: {}", e),
                    },
                )
                .await?;
            return Err(e);
        }
        Ok(running)
    }

    /// RUNNING -> PAUSED by an operator; active jobs are held.
    pub async fn pause_campaign(&self, id: Uuid, reason: &str) -> Result<Campaign, AppError> {
        let campaign = self.get_campaign(id).await?;
        let paused = self
            .lifecycle
            .transition_campaign(
                &campaign,
                CampaignTransition::ManualPause {
                    reason: reason.to_string(),
                },
            )
            .await?
            .ok_or_else(|| AppError::Conflict(format!("Campaign {} changed concurrently", id)))?;

        let jobs = self
            .lifecycle
            .store()
            .list_jobs(&JobFilter {
                statuses: JobStatus::ACTIVE.to_vec(),
                campaign_id: Some(id),
                ..Default::default()
            })
            .await?;
        for job in &jobs {
            if let Err(e) = self.lifecycle.pause_job_manually(job, reason).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to hold job");
            }
        }
        Ok(paused)
    }

    /// PAUSED -> RUNNING unless a service the campaign needs is still OPEN.
    pub async fn resume_campaign(&self, id: Uuid) -> Result<Campaign, AppError> {
        let campaign = self.get_campaign(id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(AppError::Conflict(format!(
                "Cannot resume campaign in status {}",
                campaign.status
            )));
        }
        match self.events.can_resume_campaign_safely(&campaign).await? {
            Resumability::Ready => {}
            Resumability::BlockedBy(service) => {
                return Err(AppError::Conflict(format!(
                    "Cannot resume campaign: {} service is still unavailable",
                    service
                )))
            }
            Resumability::Unavailable(reason) => {
                return Err(AppError::Conflict(format!(
                    "Cannot resume campaign: {}",
                    reason
                )))
            }
        }
        if !self.events.resume_campaign(&campaign, None).await? {
            return Err(AppError::Conflict(format!(
                "Campaign {} changed concurrently",
                id
            )));
        }
        self.get_campaign(id).await
    }

    /// Deletes finished jobs older than `days`, for one campaign or all of them.
    pub async fn cleanup_campaign_jobs(
        &self,
        campaign_id: Option<Uuid>,
        days: i64,
    ) -> Result<CleanupReport, AppError> {
        if days < 0 {
            return Err(AppError::BadRequest("days cannot be negative".to_string()));
        }
        if let Some(id) = campaign_id {
            self.get_campaign(id).await?;
        }
        let cutoff = self.lifecycle.clock().now() - ChronoDuration::days(days);
        let deleted = self
            .lifecycle
            .store()
            .delete_jobs(campaign_id, cutoff, &CLEANABLE)
            .await?;

        let mut tasks_revoked = 0;
        for task_id in deleted.iter().filter_map(|j| j.task_id.as_deref()) {
            match self.lifecycle.queue().revoke(task_id).await {
                Ok(()) => tasks_revoked += 1,
                Err(e) => tracing::warn!(task_id = task_id, error = %e, "Failed to revoke task"),
            }
        }
        tracing::info!(
            campaign_id = ?campaign_id,
            jobs_deleted = deleted.len(),
            days,
            "Cleaned up campaign jobs"
        );
        Ok(CleanupReport {
            campaign_id,
            jobs_deleted: deleted.len(),
            tasks_revoked,
            cutoff,
        })
    }

    pub async fn get_campaign_lead_stats(&self, id: Uuid) -> Result<LeadStats, AppError> {
        self.get_campaign(id).await?;
        let leads = self.lifecycle.store().list_leads(id).await?;
        let mut stats = LeadStats {
            total_leads_fetched: leads.len(),
            ..Default::default()
        };
        for lead in &leads {
            if lead.email.as_deref().is_some_and(|e| !e.trim().is_empty()) {
                stats.leads_with_email += 1;
            }
            if lead.email_verified == Some(true) {
                stats.leads_with_verified_email += 1;
            }
            if lead.enrichment_results.is_some() {
                stats.leads_with_enrichment += 1;
            }
            if lead.email_copy_gen_results.is_some() {
                stats.leads_with_email_copy += 1;
            }
            if lead.instantly_lead_record.is_some() {
                stats.leads_with_instantly_record += 1;
            }
            if lead.last_error.is_some() {
                stats.leads_with_errors += 1;
            }
        }
        Ok(stats)
    }

    pub async fn get_campaign_analytics(&self, id: Uuid) -> Result<Value, AppError> {
        let campaign = self.get_campaign(id).await?;
        let platform = self.email_platform.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("Instantly integration is not configured".to_string())
        })?;
        let external_id = campaign.instantly_campaign_id.ok_or_else(|| {
            AppError::NotFound(format!("Campaign {} has no Instantly campaign", id))
        })?;
        let analytics = self
            .guard
            .call(ThirdPartyService::Instantly, || {
                platform.get_campaign_analytics(&external_id)
            })
            .await?;
        Ok(analytics)
    }

    pub async fn get_campaign_details(&self, id: Uuid) -> Result<CampaignDetails, AppError> {
        let campaign = self.get_campaign(id).await?;
        let jobs = self
            .lifecycle
            .store()
            .list_jobs(&JobFilter {
                campaign_id: Some(id),
                ..Default::default()
            })
            .await?;
        let lead_stats = self.get_campaign_lead_stats(id).await?;
        let valid_transitions = campaign.status.valid_transitions();
        Ok(CampaignDetails {
            campaign,
            jobs,
            lead_stats,
            valid_transitions,
        })
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, AppError> {
        self.lifecycle.cancel_job(job_id).await
    }

    /// Queues a single-stage job for one lead.
    pub async fn create_lead_job(&self, lead_id: Uuid, job_type: JobType) -> Result<Job, AppError> {
        if !job_type.is_lead_scoped() || job_type == JobType::EnrichLead {
            return Err(AppError::BadRequest(format!(
                "{} cannot be queued for a single lead; use GENERATE_EMAIL_COPY, VERIFY_EMAILS or PUSH_TO_INSTANTLY",
                job_type
            )));
        }
        let lead = self
            .lifecycle
            .store()
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;
        let campaign = self.get_campaign(lead.campaign_id).await?;
        if matches!(
            campaign.status,
            CampaignStatus::Created | CampaignStatus::Paused
        ) {
            return Err(AppError::Conflict(format!(
                "Cannot queue lead jobs while campaign is {}",
                campaign.status
            )));
        }
        self.lifecycle
            .create_job(job_type, Some(campaign.id), Some(lead_id))
            .await
    }
}
