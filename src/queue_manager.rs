//! Operator-facing view and control of queued work per third-party service.

use crate::campaign_event_handler::CampaignEventHandler;
use crate::circuit_breaker::{CircuitBreakerService, CircuitStatusSnapshot};
use crate::errors::AppError;
use crate::lifecycle::Lifecycle;
use crate::models::{
    Campaign, CampaignStatus, Job, JobFilter, JobStatus, JobType, Lead, ThirdPartyService,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub circuit_breakers: CircuitStatusSnapshot,
    pub paused_jobs_by_service: BTreeMap<ThirdPartyService, usize>,
    pub paused_campaigns_by_service: BTreeMap<ThirdPartyService, usize>,
    pub total_paused_jobs: usize,
    pub total_paused_campaigns: usize,
    /// `None` when the queue backend could not be reached.
    pub queue_depth: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobFailureReport {
    pub job_id: Uuid,
    pub error: String,
}

/// Outcome of a bulk pause or resume.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceActionReport {
    pub service: ThirdPartyService,
    pub jobs_affected: usize,
    pub campaigns_affected: usize,
    pub failures: Vec<JobFailureReport>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PausedLead {
    pub lead: Lead,
    pub paused_job_ids: Vec<Uuid>,
}

pub struct QueueManager {
    breaker: Arc<CircuitBreakerService>,
    lifecycle: Lifecycle,
    events: Arc<CampaignEventHandler>,
}

impl QueueManager {
    pub fn new(
        breaker: Arc<CircuitBreakerService>,
        lifecycle: Lifecycle,
        events: Arc<CampaignEventHandler>,
    ) -> Self {
        Self {
            breaker,
            lifecycle,
            events,
        }
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, AppError> {
        let store = self.lifecycle.store();
        let circuit_breakers = self.breaker.get_circuit_status().await?;

        let paused_jobs = store
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Paused],
                ..Default::default()
            })
            .await?;
        let paused_campaigns = store.list_paused_campaigns(None).await?;

        let mut paused_jobs_by_service = BTreeMap::new();
        let mut paused_campaigns_by_service = BTreeMap::new();
        for service in ThirdPartyService::ALL {
            paused_jobs_by_service.insert(
                service,
                paused_jobs
                    .iter()
                    .filter(|j| j.paused_service == Some(service))
                    .count(),
            );
            paused_campaigns_by_service.insert(
                service,
                paused_campaigns
                    .iter()
                    .filter(|c| c.paused_service == Some(service))
                    .count(),
            );
        }

        let queue_depth = match self.lifecycle.queue().depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(error = %e, "Queue depth unavailable");
                None
            }
        };

        Ok(QueueStatus {
            circuit_breakers,
            paused_jobs_by_service,
            paused_campaigns_by_service,
            total_paused_jobs: paused_jobs.len(),
            total_paused_campaigns: paused_campaigns.len(),
            queue_depth,
            timestamp: self.lifecycle.clock().now(),
        })
    }

    async fn paused_job_count(&self, service: ThirdPartyService) -> Result<usize, AppError> {
        Ok(self.get_paused_jobs_by_service(service).await?.len())
    }

    /// Manually opens the breaker for `service` and pauses the work that depends on it.
    ///
    /// The breaker's open event pauses campaigns and active jobs; a sweep then
    /// catches jobs the event handler could not move and reports them.
    pub async fn pause_jobs_for_service(
        &self,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<ServiceActionReport, AppError> {
        let before = self.paused_job_count(service).await?;
        self.breaker.manually_pause_service(service, reason).await?;

        let dependent_types: Vec<JobType> = JobType::ALL
            .into_iter()
            .filter(|t| t.depends_on(service))
            .collect();
        let stragglers = self
            .lifecycle
            .store()
            .list_jobs(&JobFilter {
                statuses: JobStatus::ACTIVE.to_vec(),
                job_types: dependent_types,
                ..Default::default()
            })
            .await?;

        let mut failures = Vec::new();
        for job in &stragglers {
            if let Err(e) = self.lifecycle.pause_job(job, service, reason).await {
                failures.push(JobFailureReport {
                    job_id: job.id,
                    error: e.to_string(),
                });
            }
        }

        let after = self.paused_job_count(service).await?;
        let campaigns = self.get_paused_campaigns_for_service(service).await?.len();
        let jobs_affected = after.saturating_sub(before);
        Ok(ServiceActionReport {
            service,
            jobs_affected,
            campaigns_affected: campaigns,
            message: format!("Paused {} jobs for {}", jobs_affected, service),
            failures,
        })
    }

    /// Manually closes the breaker for `service` and resumes what it was holding back.
    pub async fn resume_jobs_for_service(
        &self,
        service: ThirdPartyService,
    ) -> Result<ServiceActionReport, AppError> {
        let before = self.paused_job_count(service).await?;
        let campaigns_before = self.get_paused_campaigns_for_service(service).await?.len();
        self.breaker.manually_resume_service(service).await?;

        let mut failures = Vec::new();
        for job in self.get_paused_jobs_by_service(service).await? {
            let campaign_paused = match job.campaign_id {
                Some(id) => self
                    .lifecycle
                    .store()
                    .get_campaign(id)
                    .await?
                    .is_some_and(|c| c.status == CampaignStatus::Paused),
                None => false,
            };
            if campaign_paused {
                continue;
            }
            if let Err(e) = self.lifecycle.resume_job(&job).await {
                failures.push(JobFailureReport {
                    job_id: job.id,
                    error: e.to_string(),
                });
            }
        }

        let after = self.paused_job_count(service).await?;
        let campaigns_after = self.get_paused_campaigns_for_service(service).await?.len();
        let jobs_affected = before.saturating_sub(after);
        Ok(ServiceActionReport {
            service,
            jobs_affected,
            campaigns_affected: campaigns_before.saturating_sub(campaigns_after),
            message: format!("Resumed {} jobs for {}", jobs_affected, service),
            failures,
        })
    }

    pub async fn get_paused_jobs_by_service(
        &self,
        service: ThirdPartyService,
    ) -> Result<Vec<Job>, AppError> {
        self.lifecycle
            .store()
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Paused],
                paused_service: Some(service),
                ..Default::default()
            })
            .await
    }

    /// Leads with at least one job paused for `service`, with those job ids.
    pub async fn get_paused_leads_for_recovery(
        &self,
        service: ThirdPartyService,
    ) -> Result<Vec<PausedLead>, AppError> {
        let mut by_lead: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for job in self.get_paused_jobs_by_service(service).await? {
            if let Some(lead_id) = job.lead_id {
                by_lead.entry(lead_id).or_default().push(job.id);
            }
        }

        let mut leads = Vec::with_capacity(by_lead.len());
        for (lead_id, paused_job_ids) in by_lead {
            match self.lifecycle.store().get_lead(lead_id).await? {
                Some(lead) => leads.push(PausedLead {
                    lead,
                    paused_job_ids,
                }),
                None => tracing::warn!(lead_id = %lead_id, "Paused job references missing lead"),
            }
        }
        Ok(leads)
    }

    pub async fn get_circuit_breakers(&self) -> Result<CircuitStatusSnapshot, AppError> {
        self.breaker.get_circuit_status().await
    }

    pub async fn get_paused_campaigns_for_service(
        &self,
        service: ThirdPartyService,
    ) -> Result<Vec<Campaign>, AppError> {
        self.lifecycle
            .store()
            .list_paused_campaigns(Some(service))
            .await
    }

    /// Pauses RUNNING campaigns that depend on `service` without touching its breaker.
    pub async fn pause_campaigns_for_service(
        &self,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<usize, AppError> {
        let context = crate::circuit_breaker::OpenedContext {
            failure_count: 0,
            manual: true,
        };
        self.events
            .handle_circuit_breaker_opened(service, reason, &context)
            .await
    }

    /// Resumes campaigns paused for `service` whose dependencies are all available.
    pub async fn resume_campaigns_for_service(
        &self,
        service: ThirdPartyService,
    ) -> Result<usize, AppError> {
        self.events.handle_circuit_breaker_closed(service).await
    }
}
