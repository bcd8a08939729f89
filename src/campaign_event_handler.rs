//! Reacts to circuit breaker transitions by pausing and resuming campaigns and their jobs.

use crate::campaign_lifecycle::{campaign_dependencies, CampaignTransition};
use crate::circuit_breaker::{BreakerStore, CircuitBreakerObserver, CircuitEvent, OpenedContext};
use crate::errors::AppError;
use crate::lifecycle::Lifecycle;
use crate::models::{
    Campaign, CampaignStatus, CircuitState, JobFilter, JobStatus, JobType, ThirdPartyService,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Whether a paused campaign may run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumability {
    Ready,
    /// Another service the campaign needs is still OPEN.
    BlockedBy(ThirdPartyService),
    /// The campaign cannot be evaluated (e.g. its organization is gone).
    Unavailable(String),
}

pub struct CampaignEventHandler {
    lifecycle: Lifecycle,
    breaker_state: Arc<dyn BreakerStore>,
    failure_threshold: u32,
}

impl CampaignEventHandler {
    /// Reads breaker state directly from the store so the handler never holds
    /// a reference back to the breaker service that notifies it.
    pub fn new(
        lifecycle: Lifecycle,
        breaker_state: Arc<dyn BreakerStore>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            lifecycle,
            breaker_state,
            failure_threshold,
        }
    }

    /// Pauses active jobs that call `service` and RUNNING campaigns that need it.
    ///
    /// Idempotent: only PENDING/PROCESSING jobs and RUNNING campaigns are touched.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of campaigns paused by this call.
    pub async fn handle_circuit_breaker_opened(
        &self,
        service: ThirdPartyService,
        reason: &str,
        context: &OpenedContext,
    ) -> Result<usize, AppError> {
        let store = self.lifecycle.store();
        let dependent_types: Vec<JobType> = JobType::ALL
            .into_iter()
            .filter(|t| t.depends_on(service))
            .collect();

        let jobs = store
            .list_jobs(&JobFilter {
                statuses: JobStatus::ACTIVE.to_vec(),
                job_types: dependent_types,
                ..Default::default()
            })
            .await?;

        let mut jobs_paused = 0;
        for job in &jobs {
            match self.lifecycle.pause_job(job, service, reason).await {
                Ok(Some(_)) => jobs_paused += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "Failed to pause job"),
            }
        }

        let mut campaigns_paused = 0;
        for campaign in store.list_campaigns(Some(CampaignStatus::Running)).await? {
            match self.pause_if_dependent(&campaign, service, reason).await {
                Ok(true) => campaigns_paused += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Failed to pause campaign"
                ),
            }
        }

        tracing::warn!(
            service = %service,
            manual = context.manual,
            failures = context.failure_count,
            jobs_paused,
            campaigns_paused,
            "Paused work for unavailable service"
        );
        Ok(campaigns_paused)
    }

    async fn pause_if_dependent(
        &self,
        campaign: &Campaign,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<bool, AppError> {
        let jobs = self
            .lifecycle
            .store()
            .list_jobs(&JobFilter {
                campaign_id: Some(campaign.id),
                ..Default::default()
            })
            .await?;
        if !campaign_dependencies(&jobs).contains(&service) {
            return Ok(false);
        }
        let paused = self
            .lifecycle
            .transition_campaign(
                campaign,
                CampaignTransition::Pause {
                    service,
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(paused.is_some())
    }

    /// Resumes campaigns paused for `service` when nothing else they need is OPEN.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of campaigns resumed by this call.
    pub async fn handle_circuit_breaker_closed(
        &self,
        service: ThirdPartyService,
    ) -> Result<usize, AppError> {
        let store = self.lifecycle.store();
        let mut resumed = 0;

        for campaign in store.list_paused_campaigns(Some(service)).await? {
            let outcome = match self.can_resume_campaign_safely(&campaign).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(campaign_id = %campaign.id, error = %e, "Resume check failed");
                    continue;
                }
            };
            match outcome {
                Resumability::Ready => match self.resume_campaign(&campaign, Some(service)).await {
                    Ok(true) => resumed += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Failed to resume campaign"
                    ),
                },
                Resumability::BlockedBy(other) => {
                    tracing::info!(
                        campaign_id = %campaign.id,
                        recovered = %service,
                        waiting_on = %other,
                        "Campaign still blocked"
                    );
                    if let Err(e) = self
                        .lifecycle
                        .transition_campaign(
                            &campaign,
                            CampaignTransition::Blocked { waiting_on: other },
                        )
                        .await
                    {
                        tracing::error!(campaign_id = %campaign.id, error = %e, "Failed to annotate campaign");
                    }
                }
                Resumability::Unavailable(reason) => {
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        reason = %reason,
                        "Campaign not resumable"
                    );
                }
            }
        }

        self.resume_orphaned_jobs(service).await?;

        tracing::info!(service = %service, campaigns_resumed = resumed, "Service recovered");
        Ok(resumed)
    }

    /// PAUSED -> RUNNING, then re-queues the campaign's paused jobs. A job that
    /// fails to resume is logged and the rest are still attempted.
    pub async fn resume_campaign(
        &self,
        campaign: &Campaign,
        recovered: Option<ThirdPartyService>,
    ) -> Result<bool, AppError> {
        let Some(running) = self
            .lifecycle
            .transition_campaign(campaign, CampaignTransition::Resume { recovered })
            .await?
        else {
            return Ok(false);
        };

        let paused_jobs = self
            .lifecycle
            .store()
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Paused],
                campaign_id: Some(running.id),
                ..Default::default()
            })
            .await?;
        let mut failed = 0;
        for job in &paused_jobs {
            if let Err(e) = self.lifecycle.resume_job(job).await {
                failed += 1;
                tracing::error!(campaign_id = %running.id, job_id = %job.id, error = %e, "Failed to resume job");
            }
        }
        if failed > 0 {
            tracing::warn!(
                campaign_id = %running.id,
                failed,
                total = paused_jobs.len(),
                "Campaign resumed with jobs still paused"
            );
        }
        self.lifecycle.refresh_campaign_progress(running.id).await?;
        Ok(true)
    }

    /// Jobs paused for `service` whose campaign is not itself PAUSED.
    async fn resume_orphaned_jobs(&self, service: ThirdPartyService) -> Result<usize, AppError> {
        let store = self.lifecycle.store();
        let jobs = store
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Paused],
                paused_service: Some(service),
                ..Default::default()
            })
            .await?;

        let mut resumed = 0;
        for job in &jobs {
            if let Some(campaign_id) = job.campaign_id {
                let campaign_paused = store
                    .get_campaign(campaign_id)
                    .await?
                    .is_some_and(|c| c.status == CampaignStatus::Paused);
                if campaign_paused {
                    continue;
                }
            }
            if self.lifecycle.resume_job(job).await?.is_some() {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// A paused campaign may resume when none of the services it still needs is OPEN.
    pub async fn can_resume_campaign_safely(
        &self,
        campaign: &Campaign,
    ) -> Result<Resumability, AppError> {
        let store = self.lifecycle.store();
        if let Some(organization_id) = &campaign.organization_id {
            if !store.organization_exists(organization_id).await? {
                return Ok(Resumability::Unavailable(format!(
                    "organization {} not found",
                    organization_id
                )));
            }
        }

        let jobs = store
            .list_jobs(&JobFilter {
                campaign_id: Some(campaign.id),
                ..Default::default()
            })
            .await?;
        for dependency in campaign_dependencies(&jobs) {
            let record = self
                .breaker_state
                .load(dependency, self.failure_threshold)
                .await?;
            if record.state == CircuitState::Open {
                return Ok(Resumability::BlockedBy(dependency));
            }
        }
        Ok(Resumability::Ready)
    }
}

#[async_trait]
impl CircuitBreakerObserver for CampaignEventHandler {
    async fn on_circuit_event(&self, event: &CircuitEvent) -> Result<(), AppError> {
        match event {
            CircuitEvent::Opened {
                service,
                reason,
                context,
            } => {
                self.handle_circuit_breaker_opened(*service, reason, context)
                    .await?;
            }
            CircuitEvent::Closed { service, .. } => {
                self.handle_circuit_breaker_closed(*service).await?;
            }
        }
        Ok(())
    }
}
