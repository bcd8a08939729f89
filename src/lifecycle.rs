//! Applies job and campaign transitions against the store and task queue.

use crate::campaign_lifecycle::{
    completion_transition, plan_transition, summarize_jobs, CampaignTransition,
};
use crate::clock::Clock;
use crate::errors::{AppError, ResultExt};
use crate::job_lifecycle::{cancelled_change, held_change, paused_change, resumed_change};
use crate::models::{
    Campaign, Job, JobFilter, JobStatus, JobStatusChange, JobType, ThirdPartyService,
};
use crate::store::Store;
use crate::task_queue::{JobTaskPayload, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ============ Jobs ============

    /// Persists a PENDING job and hands it to the queue.
    ///
    /// The row is written first. If the queue refuses the task the job stays
    /// PENDING without a handle and [`Self::requeue_unqueued_jobs`] picks it up.
    pub async fn create_job(
        &self,
        job_type: JobType,
        campaign_id: Option<Uuid>,
        lead_id: Option<Uuid>,
    ) -> Result<Job, AppError> {
        let mut job = Job::new(job_type, campaign_id, lead_id, self.clock.now());
        self.store.insert_job(&job).await?;
        job.task_id = self.try_enqueue(&job).await;
        tracing::debug!(job_id = %job.id, job_type = %job_type, "Job created");
        Ok(job)
    }

    /// Enqueues a task for `job` and records its handle on the row.
    pub async fn enqueue_job(&self, job: &Job, delay: Option<Duration>) -> Result<String, AppError> {
        let payload = serde_json::to_value(JobTaskPayload { job_id: job.id })?;
        let task_name = job.job_type.task_name();
        let handle = match delay {
            Some(delay) => self.queue.enqueue_after(task_name, payload, delay).await,
            None => self.queue.enqueue(task_name, payload).await,
        }
        .with_context(|| format!("Failed to enqueue job {}", job.id))?;
        self.store.set_job_task_id(job.id, &handle).await?;
        Ok(handle)
    }

    /// [`Self::enqueue_job`] for a job already persisted as PENDING; failures are
    /// left to the requeue sweep.
    async fn try_enqueue(&self, job: &Job) -> Option<String> {
        match self.enqueue_job(job, None).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job left unqueued");
                None
            }
        }
    }

    /// Re-enqueues PENDING jobs that never got a task handle.
    ///
    /// A duplicate task is harmless: only one delivery wins the claim.
    pub async fn requeue_unqueued_jobs(&self) -> Result<usize, AppError> {
        let jobs = self
            .store
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Pending],
                unqueued: true,
                ..Default::default()
            })
            .await?;

        let mut requeued = 0;
        for job in &jobs {
            match self.enqueue_job(job, None).await {
                Ok(_) => requeued += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Requeue failed");
                    break;
                }
            }
        }
        if requeued > 0 {
            tracing::info!(requeued, "Re-enqueued stranded jobs");
        }
        Ok(requeued)
    }

    /// PENDING/PROCESSING -> PAUSED. `None` if the job had already moved on.
    pub async fn pause_job(
        &self,
        job: &Job,
        service: ThirdPartyService,
        reason: &str,
    ) -> Result<Option<Job>, AppError> {
        let paused = self.hold(job, &paused_change(service, reason)).await?;
        if let Some(paused) = &paused {
            tracing::info!(job_id = %paused.id, service = %service, "⏸ Job paused");
        }
        Ok(paused)
    }

    /// Operator pause of a single job, independent of any service.
    pub async fn pause_job_manually(&self, job: &Job, reason: &str) -> Result<Option<Job>, AppError> {
        let paused = self.hold(job, &held_change(reason)).await?;
        if let Some(paused) = &paused {
            tracing::info!(job_id = %paused.id, reason = reason, "⏸ Job held");
        }
        Ok(paused)
    }

    async fn hold(&self, job: &Job, change: &JobStatusChange) -> Result<Option<Job>, AppError> {
        let paused = self
            .store
            .transition_job(job.id, &JobStatus::ACTIVE, change)
            .await?;
        // A queued task would only be discarded by the claim; drop it now.
        if paused.is_some() && job.status == JobStatus::Pending {
            if let Some(task_id) = &job.task_id {
                self.revoke_quietly(task_id).await;
            }
        }
        Ok(paused)
    }

    /// PAUSED -> PENDING and re-enqueued. An enqueue failure leaves the job
    /// PENDING and unqueued rather than failing the resume.
    pub async fn resume_job(&self, job: &Job) -> Result<Option<Job>, AppError> {
        let resumed = self
            .store
            .transition_job(job.id, &[JobStatus::Paused], &resumed_change())
            .await?;
        let Some(mut resumed) = resumed else {
            return Ok(None);
        };
        resumed.task_id = self.try_enqueue(&resumed).await;
        tracing::info!(job_id = %resumed.id, "▶ Job resumed");
        Ok(Some(resumed))
    }

    /// Cancels a non-terminal job. A running task finishes, but its result is discarded.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, AppError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        if job.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Job {} is already {}",
                job_id, job.status
            )));
        }

        let cancelled = self
            .store
            .transition_job(
                job_id,
                &JobStatus::sources_for(JobStatus::Cancelled),
                &cancelled_change(self.clock.now()),
            )
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("Job {} finished before it could be cancelled", job_id))
            })?;

        if let Some(task_id) = &cancelled.task_id {
            self.revoke_quietly(task_id).await;
        }
        if let Some(campaign_id) = cancelled.campaign_id {
            self.refresh_campaign_progress(campaign_id).await?;
        }
        tracing::info!(job_id = %job_id, "✗ Job cancelled");
        Ok(cancelled)
    }

    async fn revoke_quietly(&self, task_id: &str) {
        if let Err(e) = self.queue.revoke(task_id).await {
            tracing::warn!(task_id = task_id, error = %e, "Failed to revoke task");
        }
    }

    // ============ Campaigns ============

    /// Plans and applies a campaign transition with compare-and-set.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(campaign))` - The transition was applied.
    /// * `Ok(None)` - Another actor changed the campaign first.
    /// * `Err(AppError::Conflict)` - The current status forbids the transition.
    pub async fn transition_campaign(
        &self,
        campaign: &Campaign,
        transition: CampaignTransition,
    ) -> Result<Option<Campaign>, AppError> {
        let change = plan_transition(campaign, &transition, self.clock.now())
            .map_err(|e| AppError::Conflict(e.to_string()))?;
        let updated = self
            .store
            .update_campaign_status(campaign.id, campaign.status, &change)
            .await?;
        match &updated {
            Some(c) => tracing::info!(
                campaign_id = %c.id,
                from = %campaign.status,
                to = %c.status,
                "Campaign transition"
            ),
            None => tracing::debug!(
                campaign_id = %campaign.id,
                "Campaign changed concurrently, transition skipped"
            ),
        }
        Ok(updated)
    }

    /// Completes a RUNNING campaign once nothing is left in flight.
    pub async fn refresh_campaign_progress(
        &self,
        campaign_id: Uuid,
    ) -> Result<Option<Campaign>, AppError> {
        let Some(campaign) = self.store.get_campaign(campaign_id).await? else {
            return Ok(None);
        };
        let jobs = self
            .store
            .list_jobs(&JobFilter {
                campaign_id: Some(campaign_id),
                ..Default::default()
            })
            .await?;
        let progress = summarize_jobs(&jobs);
        match completion_transition(&campaign, &progress) {
            Some(transition) => {
                let completed = self.transition_campaign(&campaign, transition).await?;
                if completed.is_some() {
                    tracing::info!(campaign_id = %campaign_id, "✓ Campaign completed");
                }
                Ok(completed)
            }
            None => Ok(None),
        }
    }
}
