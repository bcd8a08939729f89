//! Executes pipeline jobs pulled from the task queue.
//!
//! [`JobRunner`] runs one job: claim, execute the stage, then apply the
//! outcome with compare-and-set. [`WorkerPool`] polls the queue and runs
//! tasks with bounded concurrency until shutdown, sweeping for stranded and
//! recoverable work between polls.

use crate::campaign_lifecycle::CampaignTransition;
use crate::enrichment::{leads_from_dataset, usable_email};
use crate::errors::{AppError, IntegrationError};
use crate::job_lifecycle::{
    completed_change, decide_failure, failed_change, retry_change, FailureDecision, JobFailure,
    RetryPolicy,
};
use crate::lifecycle::Lifecycle;
use crate::models::{
    Campaign, CampaignStatus, CircuitState, Job, JobFilter, JobStatus, JobType, Lead,
    LeadStageUpdate, ThirdPartyService,
};
use crate::service_guard::ServiceGuard;
use crate::services::{EmailCopyGenerator, EmailPlatform, LeadEnricher, LeadScraper, ScrapeQuery};
use crate::task_queue::{JobTaskPayload, TaskEnvelope, TaskQueue};
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// The third-party clients a worker calls.
#[derive(Clone)]
pub struct Integrations {
    pub scraper: Arc<dyn LeadScraper>,
    pub enricher: Arc<dyn LeadEnricher>,
    pub copywriter: Arc<dyn EmailCopyGenerator>,
    pub email_platform: Arc<dyn EmailPlatform>,
}

/// What a successful stage produced.
#[derive(Debug, Default)]
struct StageOutput {
    result: Value,
    /// Leads stored by a fetch; each gets an ENRICH_LEAD job.
    leads: Vec<Lead>,
}

impl StageOutput {
    fn result(result: Value) -> Self {
        Self {
            result,
            leads: Vec::new(),
        }
    }
}

pub struct JobRunner {
    lifecycle: Lifecycle,
    guard: Arc<ServiceGuard>,
    integrations: Integrations,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(
        lifecycle: Lifecycle,
        guard: Arc<ServiceGuard>,
        integrations: Integrations,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            lifecycle,
            guard,
            integrations,
            retry,
        }
    }

    /// Runs the job a task points at. Malformed payloads are dropped.
    pub async fn handle_task(&self, task: &TaskEnvelope) -> Result<(), AppError> {
        let payload: JobTaskPayload = match serde_json::from_value(task.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(task = %task.handle, error = %e, "Dropping task with invalid payload");
                return Ok(());
            }
        };
        self.process_job(payload.job_id).await
    }

    /// Claims and executes one job. Re-delivered or no longer PENDING jobs are skipped.
    pub async fn process_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let Some(job) = self.lifecycle.store().claim_job(job_id).await? else {
            tracing::debug!(job_id = %job_id, "Job not pending, skipping delivery");
            return Ok(());
        };
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            "▶ Processing job"
        );

        match self.execute(&job).await {
            Ok(output) => self.finish_success(&job, output).await,
            Err(failure) => self.finish_failure(&job, failure).await,
        }
    }

    async fn execute(&self, job: &Job) -> Result<StageOutput, JobFailure> {
        match job.job_type {
            JobType::FetchLeads => self.fetch_leads(job).await,
            JobType::EnrichLead => self.enrich_lead(job).await,
            JobType::VerifyEmails => {
                let lead = self.lead_of(job).await?;
                let verified = self.verify_email(&lead).await?;
                Ok(StageOutput::result(json!({ "email_verified": verified })))
            }
            JobType::GenerateEmailCopy => {
                let lead = self.lead_of(job).await?;
                self.generate_copy(&lead).await?;
                Ok(StageOutput::result(json!({ "lead_id": lead.id, "stage": "email_copy" })))
            }
            JobType::PushToInstantly => {
                let lead = self.lead_of(job).await?;
                self.push_to_platform(&lead).await?;
                Ok(StageOutput::result(json!({ "lead_id": lead.id, "stage": "instantly" })))
            }
        }
    }

    // ============ Stages ============

    async fn campaign_of(&self, job: &Job) -> Result<Campaign, JobFailure> {
        let campaign_id = job.campaign_id.ok_or_else(|| {
            IntegrationError::Validation(format!("Job {} has no campaign", job.id))
        })?;
        self.lifecycle
            .store()
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| {
                IntegrationError::Validation(format!("Campaign {} not found", campaign_id)).into()
            })
    }

    async fn lead_of(&self, job: &Job) -> Result<Lead, JobFailure> {
        let lead_id = job
            .lead_id
            .ok_or_else(|| IntegrationError::Validation(format!("Job {} has no lead", job.id)))?;
        self.lifecycle
            .store()
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| IntegrationError::Validation(format!("Lead {} not found", lead_id)).into())
    }

    async fn fetch_leads(&self, job: &Job) -> Result<StageOutput, JobFailure> {
        let campaign = self.campaign_of(job).await?;
        let query = ScrapeQuery {
            file_name: campaign.file_name.clone(),
            total_records: campaign.total_records,
            url: campaign.url.clone(),
        };
        let scraper = &self.integrations.scraper;
        let items = self
            .guard
            .call(ThirdPartyService::Apollo, || scraper.run(&query))
            .await?;

        let mut new_leads = leads_from_dataset(&items);
        new_leads.truncate(usize::try_from(campaign.total_records).unwrap_or(0));
        let leads = self
            .lifecycle
            .store()
            .upsert_leads(campaign.id, &new_leads)
            .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            records = items.len(),
            leads = leads.len(),
            "Leads fetched"
        );
        Ok(StageOutput {
            result: json!({ "records": items.len(), "leads": leads.len() }),
            leads,
        })
    }

    /// Runs every stage the lead has not completed yet, so a retry resumes
    /// where the previous attempt stopped.
    async fn enrich_lead(&self, job: &Job) -> Result<StageOutput, JobFailure> {
        let mut lead = self.lead_of(job).await?;
        let mut stages = Vec::new();

        let verified = match lead.email_verified {
            Some(verified) => verified,
            None => {
                stages.push("verify_email");
                self.verify_email(&lead).await?
            }
        };
        if !verified {
            return Err(IntegrationError::Validation(format!(
                "Lead {} has no usable email",
                lead.id
            ))
            .into());
        }

        if lead.enrichment_results.is_none() {
            let enricher = &self.integrations.enricher;
            let enrichment = self
                .guard
                .call(ThirdPartyService::Perplexity, || enricher.enrich(&lead))
                .await?;
            self.lifecycle
                .store()
                .update_lead_stage(lead.id, &LeadStageUpdate::Enrichment(enrichment.clone()))
                .await?;
            lead.enrichment_results = Some(enrichment);
            stages.push("enrichment");
        }

        if lead.email_copy_gen_results.is_none() {
            lead.email_copy_gen_results = Some(self.generate_copy(&lead).await?);
            stages.push("email_copy");
        }

        if lead.instantly_lead_record.is_none() {
            self.push_to_platform(&lead).await?;
            stages.push("instantly");
        }

        Ok(StageOutput::result(json!({ "lead_id": lead.id, "stages_run": stages })))
    }

    async fn verify_email(&self, lead: &Lead) -> Result<bool, JobFailure> {
        let verified = usable_email(lead).is_some();
        self.lifecycle
            .store()
            .update_lead_stage(lead.id, &LeadStageUpdate::EmailVerified(verified))
            .await?;
        Ok(verified)
    }

    async fn generate_copy(&self, lead: &Lead) -> Result<Value, JobFailure> {
        let copywriter = &self.integrations.copywriter;
        let copy = self
            .guard
            .call(ThirdPartyService::OpenAi, || {
                copywriter.generate(lead, lead.enrichment_results.as_ref())
            })
            .await?;
        self.lifecycle
            .store()
            .update_lead_stage(lead.id, &LeadStageUpdate::EmailCopy(copy.clone()))
            .await?;
        Ok(copy)
    }

    async fn push_to_platform(&self, lead: &Lead) -> Result<Value, JobFailure> {
        let store = self.lifecycle.store();
        let platform = &self.integrations.email_platform;
        let campaign = store.get_campaign(lead.campaign_id).await?.ok_or_else(|| {
            IntegrationError::Validation(format!("Campaign {} not found", lead.campaign_id))
        })?;

        let external_id = match campaign.instantly_campaign_id {
            Some(id) => id,
            None => {
                let id = self
                    .guard
                    .call(ThirdPartyService::Instantly, || {
                        platform.create_campaign(&campaign.name)
                    })
                    .await?;
                store.set_instantly_campaign_id(campaign.id, &id).await?;
                id
            }
        };

        let record = self
            .guard
            .call(ThirdPartyService::Instantly, || {
                platform.push_lead(&external_id, lead, lead.email_copy_gen_results.as_ref())
            })
            .await?;
        store
            .update_lead_stage(lead.id, &LeadStageUpdate::InstantlyRecord(record.clone()))
            .await?;
        Ok(record)
    }

    // ============ Outcomes ============

    async fn finish_success(&self, job: &Job, output: StageOutput) -> Result<(), AppError> {
        let store = self.lifecycle.store();

        // Lead jobs exist before the fetch is COMPLETED, so a failure here
        // leaves the fetch retryable and the retry re-runs the idempotent spawn.
        if job.job_type == JobType::FetchLeads {
            if let Some(campaign_id) = job.campaign_id {
                let processing = store
                    .get_job(job.id)
                    .await?
                    .is_some_and(|j| j.status == JobStatus::Processing);
                if !processing {
                    tracing::info!(job_id = %job.id, "Job no longer processing, result discarded");
                    return Ok(());
                }
                if let Err(e) = self.spawn_lead_jobs(campaign_id, &output.leads).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to spawn lead jobs");
                    return self.finish_failure(job, JobFailure::from(e)).await;
                }
            }
        }

        let change = completed_change(output.result.to_string(), self.lifecycle.clock().now());
        let Some(done) = store
            .transition_job(job.id, &[JobStatus::Processing], &change)
            .await?
        else {
            tracing::info!(job_id = %job.id, "Job no longer processing, result discarded");
            return Ok(());
        };
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "✓ Job completed");

        if let Some(campaign_id) = done.campaign_id {
            self.lifecycle.refresh_campaign_progress(campaign_id).await?;
        }
        Ok(())
    }

    /// One ENRICH_LEAD job per fetched lead that does not already have one.
    async fn spawn_lead_jobs(&self, campaign_id: Uuid, leads: &[Lead]) -> Result<(), AppError> {
        let store = self.lifecycle.store();
        let existing: HashSet<Uuid> = store
            .list_jobs(&JobFilter {
                campaign_id: Some(campaign_id),
                job_types: vec![JobType::EnrichLead],
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter_map(|j| j.lead_id)
            .collect();

        let mut created = Vec::new();
        for lead in leads.iter().filter(|l| !existing.contains(&l.id)) {
            created.push(
                self.lifecycle
                    .create_job(JobType::EnrichLead, Some(campaign_id), Some(lead.id))
                    .await?,
            );
        }

        let Some(campaign) = store.get_campaign(campaign_id).await? else {
            return Ok(());
        };
        let campaign = match self
            .lifecycle
            .transition_campaign(
                &campaign,
                CampaignTransition::FetchCompleted {
                    lead_count: leads.len(),
                },
            )
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => campaign,
            Err(e) => {
                tracing::warn!(campaign_id = %campaign_id, error = %e, "Fetch result not recorded on campaign");
                campaign
            }
        };

        // The campaign was paused while the fetch finished; hold the new work too.
        if campaign.status == CampaignStatus::Paused {
            for job in &created {
                match campaign.paused_service {
                    Some(service) => {
                        self.lifecycle
                            .pause_job(job, service, "campaign paused")
                            .await?;
                    }
                    None => {
                        self.lifecycle
                            .pause_job_manually(job, "campaign paused")
                            .await?;
                    }
                }
            }
        }

        tracing::info!(
            campaign_id = %campaign_id,
            enrich_jobs = created.len(),
            "Spawned lead jobs"
        );
        Ok(())
    }

    async fn finish_failure(&self, job: &Job, failure: JobFailure) -> Result<(), AppError> {
        let store = self.lifecycle.store();
        match decide_failure(job, &failure, &self.retry) {
            FailureDecision::Retry {
                attempts,
                delay,
                error,
            } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Job failed, retrying"
                );
                if let Some(pending) = store
                    .transition_job(job.id, &[JobStatus::Processing], &retry_change(attempts, error))
                    .await?
                {
                    // Left unqueued on failure; the sweep enqueues it without the delay.
                    if let Err(e) = self.lifecycle.enqueue_job(&pending, Some(delay)).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Retry left unqueued");
                    }
                }
            }
            FailureDecision::Pause { service, reason } => {
                self.lifecycle.pause_job(job, service, &reason).await?;
                if let Some(campaign_id) = job.campaign_id {
                    if let Some(campaign) = store.get_campaign(campaign_id).await? {
                        if campaign.status == CampaignStatus::Running {
                            self.lifecycle
                                .transition_campaign(
                                    &campaign,
                                    CampaignTransition::Pause { service, reason },
                                )
                                .await?;
                        }
                    }
                }
            }
            FailureDecision::Fail { attempts, error } => {
                tracing::error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts,
                    error = %error,
                    "❌ Job failed"
                );
                let change = failed_change(error.clone(), Some(attempts), self.lifecycle.clock().now());
                let Some(failed) = store
                    .transition_job(job.id, &[JobStatus::Processing], &change)
                    .await?
                else {
                    return Ok(());
                };

                if job.job_type.is_campaign_critical() {
                    if let Some(campaign_id) = failed.campaign_id {
                        self.fail_campaign(campaign_id, &error).await?;
                    }
                } else if let Some(lead_id) = failed.lead_id {
                    store
                        .update_lead_stage(lead_id, &LeadStageUpdate::Error(error))
                        .await?;
                }
                if let Some(campaign_id) = failed.campaign_id {
                    self.lifecycle.refresh_campaign_progress(campaign_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn fail_campaign(&self, campaign_id: Uuid, error: &str) -> Result<(), AppError> {
        let Some(campaign) = self.lifecycle.store().get_campaign(campaign_id).await? else {
            return Ok(());
        };
        if campaign.status.is_terminal() {
            return Ok(());
        }
        self.lifecycle
            .transition_campaign(
                &campaign,
                CampaignTransition::Fail {
                    error: error.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // ============ Sweep ============

    /// Periodic upkeep: re-enqueues PENDING jobs that never reached the queue
    /// and releases a recovery job for every service whose cool-down has passed.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let requeued = match self.lifecycle.requeue_unqueued_jobs().await {
            Ok(requeued) => requeued,
            Err(e) => {
                tracing::warn!(error = %e, "Requeue sweep failed");
                0
            }
        };
        let mut recoveries = 0;
        for service in ThirdPartyService::ALL {
            match self.release_recovery_job(service).await {
                Ok(true) => recoveries += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(service = %service, error = %e, "Recovery release failed"),
            }
        }
        Ok(SweepReport { requeued, recoveries })
    }

    /// Nothing calls a service while its dependent work is paused, so the
    /// breaker would never see the HALF_OPEN probe on its own. Once the
    /// cool-down has passed, one paused job is put back on the queue; its call
    /// becomes the probe whose outcome closes or re-opens the circuit.
    async fn release_recovery_job(&self, service: ThirdPartyService) -> Result<bool, AppError> {
        let breaker = self.guard.breaker();
        let record = breaker.get_service_state(service).await?;
        let cooldown = ChronoDuration::milliseconds(breaker.settings().cooldown_millis());
        let now = self.lifecycle.clock().now();
        let due = match record.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                !record.manual_override && record.opened_at.map_or(true, |at| at + cooldown <= now)
            }
            // A probe is already out unless it went stale.
            CircuitState::HalfOpen => record.half_open_at.map_or(true, |at| at + cooldown <= now),
        };
        if !due {
            return Ok(false);
        }

        let Some(job) = self.recovery_candidate(service).await? else {
            tracing::debug!(service = %service, "No paused work to recover with");
            return Ok(false);
        };
        if !breaker.admit(service).await.probe {
            return Ok(false);
        }
        // The slot goes to the released job when its call reaches the guard.
        breaker.release_probe(service).await;

        match self.lifecycle.resume_job(&job).await? {
            Some(_) => {
                tracing::info!(service = %service, job_id = %job.id, "Released recovery job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A PAUSED job that calls `service`, preferring jobs paused for it.
    /// Operator holds and jobs of manually paused campaigns are never chosen.
    async fn recovery_candidate(&self, service: ThirdPartyService) -> Result<Option<Job>, AppError> {
        let store = self.lifecycle.store();
        let mut jobs = store
            .list_jobs(&JobFilter {
                statuses: vec![JobStatus::Paused],
                job_types: JobType::ALL
                    .into_iter()
                    .filter(|t| t.depends_on(service))
                    .collect(),
                ..Default::default()
            })
            .await?;
        jobs.retain(|j| j.paused_service.is_some());
        jobs.sort_by_key(|j| j.paused_service != Some(service));

        for job in jobs {
            let held_by_operator = match job.campaign_id {
                Some(campaign_id) => store.get_campaign(campaign_id).await?.is_some_and(|c| {
                    c.status == CampaignStatus::Paused && c.paused_service.is_none()
                }),
                None => false,
            };
            if !held_by_operator {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

/// What one [`JobRunner::sweep`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: usize,
    pub recoveries: usize,
}

// ============ Pool ============

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Interval between [`JobRunner::sweep`] runs.
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    tasks_started: AtomicU64,
    tasks_errored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub tasks_started: u64,
    pub tasks_errored: u64,
}

pub struct WorkerPool {
    runner: Arc<JobRunner>,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(runner: Arc<JobRunner>, queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        Self {
            runner,
            queue,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            tasks_started: self.counters.tasks_started.load(Ordering::Relaxed),
            tasks_errored: self.counters.tasks_errored.load(Ordering::Relaxed),
        }
    }

    /// Polls until `shutdown` resolves, then waits for in-flight tasks.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<WorkerStats, AppError> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(concurrency = self.config.concurrency, "Worker started");
        let mut last_sweep: Option<Instant> = None;
        loop {
            if last_sweep.map_or(true, |at| at.elapsed() >= self.config.sweep_interval) {
                if let Err(e) = self.runner.sweep().await {
                    tracing::warn!(error = %e, "Worker sweep failed");
                }
                last_sweep = Some(Instant::now());
            }
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| AppError::InternalError(format!("Worker semaphore closed: {}", e)))?,
            };
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }

            match self.queue.dequeue().await {
                Ok(Some(task)) => {
                    let runner = Arc::clone(&self.runner);
                    let counters = Arc::clone(&self.counters);
                    counters.tasks_started.fetch_add(1, Ordering::Relaxed);
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = runner.handle_task(&task).await {
                            counters.tasks_errored.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                task = %task.handle,
                                task_name = %task.task_name,
                                error = %e,
                                "Task failed"
                            );
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Failed to poll task queue");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Worker stopping, draining tasks");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        let stats = self.stats();
        tracing::info!(
            tasks_started = stats.tasks_started,
            tasks_errored = stats.tasks_errored,
            "Worker stopped"
        );
        Ok(stats)
    }
}
