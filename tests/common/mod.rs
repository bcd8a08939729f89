//! Shared harness: in-memory backends, a hand-driven clock and scripted
//! integration clients.
#![allow(dead_code)]

use async_trait::async_trait;
use rust_leadgen_api::bootstrap::{build_services, Backends, Services};
use rust_leadgen_api::circuit_breaker::{BreakerSettings, InMemoryBreakerStore};
use rust_leadgen_api::clock::ManualClock;
use rust_leadgen_api::config::RateLimit;
use rust_leadgen_api::errors::{AppError, IntegrationError};
use rust_leadgen_api::job_lifecycle::RetryPolicy;
use rust_leadgen_api::models::{
    Campaign, CreateCampaignRequest, Job, JobFilter, JobStatus, JobType, Lead, ThirdPartyService,
};
use rust_leadgen_api::rate_limiter::InMemoryCounterStore;
use rust_leadgen_api::services::{
    EmailCopyGenerator, EmailPlatform, LeadEnricher, LeadScraper, ScrapeQuery,
};
use rust_leadgen_api::store::{InMemoryStore, Store};
use rust_leadgen_api::task_queue::{InMemoryTaskQueue, TaskEnvelope, TaskQueue};
use rust_leadgen_api::worker::{Integrations, JobRunner};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const SEARCH_URL: &str = "https://app.apollo.io/#/people?personTitles=cto";

/// Scripted outcomes, consumed one per call; `Ok` once the script runs out.
#[derive(Default)]
pub struct Script {
    failures: Mutex<VecDeque<IntegrationError>>,
    calls: AtomicUsize,
}

impl Script {
    pub fn fail_next(&self, error: IntegrationError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<(), IntegrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub fn transient(service: ThirdPartyService) -> IntegrationError {
    IntegrationError::Transient {
        service,
        message: "HTTP 503: upstream unavailable".to_string(),
    }
}

pub fn person(first: &str, last: &str, email: &str, company: &str) -> Value {
    json!({
        "first_name": first,
        "last_name": last,
        "email": email,
        "organization_name": company,
        "title": "Head of Sales",
    })
}

#[derive(Default)]
pub struct FakeScraper {
    pub script: Script,
    pub records: Mutex<Vec<Value>>,
}

#[async_trait]
impl LeadScraper for FakeScraper {
    async fn run(&self, _query: &ScrapeQuery) -> Result<Vec<Value>, IntegrationError> {
        self.script.next()?;
        Ok(self.records.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeEnricher {
    pub script: Script,
    /// Leads (by email) whose enrichment always fails transiently.
    pub failing_emails: Mutex<Vec<String>>,
}

impl FakeEnricher {
    pub fn always_fail_for(&self, email: &str) {
        self.failing_emails.lock().unwrap().push(email.to_string());
    }
}

#[async_trait]
impl LeadEnricher for FakeEnricher {
    async fn enrich(&self, lead: &Lead) -> Result<Value, IntegrationError> {
        self.script.next()?;
        let email = lead.email.clone().unwrap_or_default();
        if self.failing_emails.lock().unwrap().contains(&email) {
            return Err(transient(ThirdPartyService::Perplexity));
        }
        Ok(json!({
            "choices": [{"message": {"content": format!("{} is growing fast.", lead.company.clone().unwrap_or_default())}}]
        }))
    }
}

#[derive(Default)]
pub struct FakeCopywriter {
    pub script: Script,
}

#[async_trait]
impl EmailCopyGenerator for FakeCopywriter {
    async fn generate(
        &self,
        lead: &Lead,
        _enrichment: Option<&Value>,
    ) -> Result<Value, IntegrationError> {
        self.script.next()?;
        Ok(json!({
            "choices": [{"message": {"content": format!("Hi {},", lead.first_name.clone().unwrap_or_default())}}]
        }))
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub script: Script,
    pub campaigns_created: AtomicUsize,
    pub pushed: Mutex<Vec<(String, Uuid)>>,
}

#[async_trait]
impl EmailPlatform for FakePlatform {
    async fn create_campaign(&self, name: &str) -> Result<String, IntegrationError> {
        self.script.next()?;
        let n = self.campaigns_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ext-{}-{}", name.replace(' ', "-"), n))
    }

    async fn push_lead(
        &self,
        external_campaign_id: &str,
        lead: &Lead,
        _copy: Option<&Value>,
    ) -> Result<Value, IntegrationError> {
        self.script.next()?;
        self.pushed
            .lock()
            .unwrap()
            .push((external_campaign_id.to_string(), lead.id));
        Ok(json!({"id": format!("lead-{}", lead.id), "email": lead.email}))
    }

    async fn get_campaign_analytics(
        &self,
        external_campaign_id: &str,
    ) -> Result<Value, IntegrationError> {
        self.script.next()?;
        Ok(json!({"campaign_id": external_campaign_id, "emails_sent_count": 12}))
    }
}

/// Queue that refuses enqueues once its budget is spent, until healed.
pub struct FlakyQueue {
    inner: Arc<InMemoryTaskQueue>,
    budget: Mutex<Option<usize>>,
}

impl FlakyQueue {
    pub fn new(inner: Arc<InMemoryTaskQueue>) -> Self {
        Self {
            inner,
            budget: Mutex::new(None),
        }
    }

    pub fn fail_after(&self, enqueues: usize) {
        *self.budget.lock().unwrap() = Some(enqueues);
    }

    pub fn heal(&self) {
        *self.budget.lock().unwrap() = None;
    }

    fn take(&self) -> Result<(), AppError> {
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => Err(AppError::InternalError("queue unavailable".to_string())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn enqueue(&self, task_name: &str, payload: Value) -> Result<String, AppError> {
        self.take()?;
        self.inner.enqueue(task_name, payload).await
    }

    async fn enqueue_after(
        &self,
        task_name: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<String, AppError> {
        self.take()?;
        self.inner.enqueue_after(task_name, payload, delay).await
    }

    async fn dequeue(&self) -> Result<Option<TaskEnvelope>, AppError> {
        self.inner.dequeue().await
    }

    async fn revoke(&self, handle: &str) -> Result<(), AppError> {
        self.inner.revoke(handle).await
    }

    async fn depth(&self) -> Result<u64, AppError> {
        self.inner.depth().await
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    /// The queue the services enqueue through; wraps `queue`.
    pub flaky: Arc<FlakyQueue>,
    pub services: Services,
    pub runner: JobRunner,
    pub scraper: Arc<FakeScraper>,
    pub enricher: Arc<FakeEnricher>,
    pub copywriter: Arc<FakeCopywriter>,
    pub platform: Arc<FakePlatform>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(
            BreakerSettings {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
            RateLimit::new(1_000, 60),
        )
        .await
    }

    pub async fn with_settings(settings: BreakerSettings, limit: RateLimit) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new(clock.clone()));
        let flaky = Arc::new(FlakyQueue::new(queue.clone()));
        let backends = Backends {
            store: store.clone(),
            queue: flaky.clone(),
            breaker_store: Arc::new(InMemoryBreakerStore::new()),
            counters: Arc::new(InMemoryCounterStore::new()),
            clock: clock.clone(),
            redis: None,
        };

        let scraper = Arc::new(FakeScraper::default());
        let enricher = Arc::new(FakeEnricher::default());
        let copywriter = Arc::new(FakeCopywriter::default());
        let platform = Arc::new(FakePlatform::default());

        let services = build_services(&backends, settings, |_| limit, Some(platform.clone())).await;
        let runner = JobRunner::new(
            services.lifecycle.clone(),
            services.guard.clone(),
            Integrations {
                scraper: scraper.clone(),
                enricher: enricher.clone(),
                copywriter: copywriter.clone(),
                email_platform: platform.clone(),
            },
            RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(300)),
        );

        Self {
            clock,
            store,
            queue,
            flaky,
            services,
            runner,
            scraper,
            enricher,
            copywriter,
            platform,
        }
    }

    pub fn set_records(&self, records: Vec<Value>) {
        *self.scraper.records.lock().unwrap() = records;
    }

    pub fn default_records() -> Vec<Value> {
        vec![
            person("Ana", "Silva", "ana@acme.io", "Acme"),
            person("Bruno", "Costa", "bruno@globex.com", "Globex"),
            person("Carla", "Dias", "carla@initech.com", "Initech"),
        ]
    }

    pub async fn create_campaign(&self, total_records: i32) -> Campaign {
        self.create_campaign_for(None, total_records).await
    }

    pub async fn create_campaign_for(
        &self,
        organization_id: Option<&str>,
        total_records: i32,
    ) -> Campaign {
        self.services
            .campaigns
            .create_campaign(&CreateCampaignRequest {
                name: "Q3 outbound".to_string(),
                description: None,
                organization_id: organization_id.map(str::to_string),
                file_name: "q3-outbound".to_string(),
                total_records,
                url: SEARCH_URL.to_string(),
            })
            .await
            .expect("campaign created")
    }

    pub async fn started_campaign(&self) -> Campaign {
        self.set_records(Self::default_records());
        let campaign = self.create_campaign(3).await;
        self.services
            .campaigns
            .start_campaign(campaign.id)
            .await
            .expect("campaign started")
    }

    /// Sweeps, then runs everything due; repeated until a sweep finds nothing to do.
    pub async fn sweep_and_drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let report = self.runner.sweep().await.expect("sweep");
            let drained = self.drain().await;
            ran += drained;
            if report.requeued == 0 && report.recoveries == 0 && drained == 0 {
                return ran;
            }
        }
    }

    /// Runs the next due task, if any.
    pub async fn run_next(&self) -> bool {
        match self.queue.dequeue().await.expect("dequeue") {
            Some(task) => {
                self.runner.handle_task(&task).await.expect("task handled");
                true
            }
            None => false,
        }
    }

    /// Runs every task that is due now; returns how many ran.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.dequeue().await.expect("dequeue") {
            self.runner.handle_task(&task).await.expect("task handled");
            ran += 1;
            assert!(ran < 1_000, "queue did not drain");
        }
        ran
    }

    pub async fn campaign(&self, id: Uuid) -> Campaign {
        self.store
            .get_campaign(id)
            .await
            .unwrap()
            .expect("campaign exists")
    }

    pub async fn jobs(&self, campaign_id: Uuid) -> Vec<Job> {
        self.store
            .list_jobs(&JobFilter {
                campaign_id: Some(campaign_id),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn jobs_of(&self, campaign_id: Uuid, job_type: JobType) -> Vec<Job> {
        self.jobs(campaign_id)
            .await
            .into_iter()
            .filter(|j| j.job_type == job_type)
            .collect()
    }

    pub async fn count_status(&self, campaign_id: Uuid, status: JobStatus) -> usize {
        self.jobs(campaign_id)
            .await
            .iter()
            .filter(|j| j.status == status)
            .count()
    }
}
