//! Persistence seam for campaigns, jobs and leads.
//!
//! Status writes are compare-and-set: they name the status (or statuses) the
//! row must currently hold and return `None` when it does not, so concurrent
//! actors never overwrite each other's transitions.

use crate::errors::AppError;
use crate::models::{
    Campaign, CampaignStatus, CampaignStatusChange, Job, JobFilter, JobStatus, JobStatusChange,
    Lead, LeadStageUpdate, NewLead, ThirdPartyService,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // ---- campaigns ----
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), AppError>;
    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, AppError>;
    async fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<Campaign>, AppError>;
    /// PAUSED campaigns, optionally only those paused for `service`.
    async fn list_paused_campaigns(
        &self,
        service: Option<ThirdPartyService>,
    ) -> Result<Vec<Campaign>, AppError>;
    async fn update_campaign_status(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        change: &CampaignStatusChange,
    ) -> Result<Option<Campaign>, AppError>;
    async fn set_instantly_campaign_id(&self, id: Uuid, external_id: &str)
        -> Result<(), AppError>;
    async fn organization_exists(&self, organization_id: &str) -> Result<bool, AppError>;

    // ---- jobs ----
    async fn insert_job(&self, job: &Job) -> Result<(), AppError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AppError>;
    async fn set_job_task_id(&self, id: Uuid, task_id: &str) -> Result<(), AppError>;
    /// PENDING -> PROCESSING; `None` when the job is not PENDING.
    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, AppError>;
    async fn transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        change: &JobStatusChange,
    ) -> Result<Option<Job>, AppError>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, AppError>;
    /// Deletes matching jobs created before `created_before` and returns them.
    async fn delete_jobs(
        &self,
        campaign_id: Option<Uuid>,
        created_before: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, AppError>;

    // ---- leads ----
    /// Inserts leads not already stored for the campaign (by dedupe key) and
    /// returns every campaign lead matching the input keys.
    async fn upsert_leads(
        &self,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Lead>, AppError>;
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError>;
    async fn update_lead_stage(
        &self,
        id: Uuid,
        update: &LeadStageUpdate,
    ) -> Result<Option<Lead>, AppError>;
    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, AppError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), AppError>;
}

#[derive(Default)]
struct MemoryState {
    campaigns: HashMap<Uuid, Campaign>,
    jobs: HashMap<Uuid, Job>,
    leads: HashMap<Uuid, Lead>,
    organizations: HashSet<String>,
}

/// Mutex-guarded maps; every trait call is atomic.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_organization(&self, organization_id: &str) {
        self.state
            .lock()
            .await
            .organizations
            .insert(organization_id.to_string());
    }

    pub async fn remove_organization(&self, organization_id: &str) {
        self.state.lock().await.organizations.remove(organization_id);
    }
}

fn apply_campaign_change(campaign: &mut Campaign, change: &CampaignStatusChange) {
    campaign.status = change.status;
    campaign.status_message = change.status_message.clone();
    campaign.status_error = change.status_error.clone();
    campaign.paused_service = change.paused_service;
    if change.fetch_completed_at.is_some() {
        campaign.fetch_completed_at = change.fetch_completed_at;
    }
    if change.completed_at.is_some() {
        campaign.completed_at = change.completed_at;
    }
    if change.failed_at.is_some() {
        campaign.failed_at = change.failed_at;
    }
    campaign.updated_at = Utc::now();
}

fn apply_job_change(job: &mut Job, change: &JobStatusChange) {
    job.status = change.status;
    if change.result.is_some() {
        job.result = change.result.clone();
    }
    if change.error.is_some() {
        job.error = change.error.clone();
    }
    if let Some(attempts) = change.attempts {
        job.attempts = attempts;
    }
    job.paused_service = change.paused_service;
    // Back to PENDING means the previous task is spent; the caller enqueues anew.
    if change.status == JobStatus::Pending {
        job.task_id = None;
    }
    if change.completed_at.is_some() {
        job.completed_at = change.completed_at;
    }
    job.updated_at = Utc::now();
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), AppError> {
        self.state
            .lock()
            .await
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, AppError> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<Campaign>, AppError> {
        let state = self.state.lock().await;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn list_paused_campaigns(
        &self,
        service: Option<ThirdPartyService>,
    ) -> Result<Vec<Campaign>, AppError> {
        let state = self.state.lock().await;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Paused)
            .filter(|c| service.map_or(true, |s| c.paused_service == Some(s)))
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        change: &CampaignStatusChange,
    ) -> Result<Option<Campaign>, AppError> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(campaign) if campaign.status == expected => {
                apply_campaign_change(campaign, change);
                Ok(Some(campaign.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_instantly_campaign_id(
        &self,
        id: Uuid,
        external_id: &str,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))?;
        campaign.instantly_campaign_id = Some(external_id.to_string());
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn organization_exists(&self, organization_id: &str) -> Result<bool, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .contains(organization_id))
    }

    async fn insert_job(&self, job: &Job) -> Result<(), AppError> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn set_job_task_id(&self, id: Uuid, task_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.task_id = Some(task_id.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        change: &JobStatusChange,
    ) -> Result<Option<Job>, AppError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if from.contains(&job.status) => {
                apply_job_change(job, change);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, AppError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn delete_jobs(
        &self,
        campaign_id: Option<Uuid>,
        created_before: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, AppError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| campaign_id.map_or(true, |id| j.campaign_id == Some(id)))
            .filter(|j| j.created_at < created_before && statuses.contains(&j.status))
            .map(|j| j.id)
            .collect();
        Ok(doomed
            .into_iter()
            .filter_map(|id| state.jobs.remove(&id))
            .collect())
    }

    async fn upsert_leads(
        &self,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Lead>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut stored = Vec::with_capacity(leads.len());
        for new_lead in leads {
            let existing = state
                .leads
                .values()
                .find(|l| l.campaign_id == campaign_id && l.dedupe_key == new_lead.dedupe_key)
                .cloned();
            let lead = match existing {
                Some(lead) => lead,
                None => {
                    let lead = new_lead.clone().into_lead(campaign_id, now);
                    state.leads.insert(lead.id, lead.clone());
                    lead
                }
            };
            if !stored.iter().any(|l: &Lead| l.id == lead.id) {
                stored.push(lead);
            }
        }
        Ok(stored)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.state.lock().await.leads.get(&id).cloned())
    }

    async fn update_lead_stage(
        &self,
        id: Uuid,
        update: &LeadStageUpdate,
    ) -> Result<Option<Lead>, AppError> {
        let mut state = self.state.lock().await;
        let Some(lead) = state.leads.get_mut(&id) else {
            return Ok(None);
        };
        match update {
            LeadStageUpdate::EmailVerified(verified) => lead.email_verified = Some(*verified),
            LeadStageUpdate::Enrichment(v) => lead.enrichment_results = Some(v.clone()),
            LeadStageUpdate::EmailCopy(v) => lead.email_copy_gen_results = Some(v.clone()),
            LeadStageUpdate::InstantlyRecord(v) => lead.instantly_lead_record = Some(v.clone()),
            LeadStageUpdate::Error(e) => lead.last_error = Some(e.clone()),
        }
        lead.updated_at = Utc::now();
        Ok(Some(lead.clone()))
    }

    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let state = self.state.lock().await;
        let mut leads: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.campaign_id == campaign_id)
            .cloned()
            .collect();
        leads.sort_by_key(|l| l.created_at);
        Ok(leads)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobType;
    use serde_json::json;

    fn new_lead(key: &str) -> NewLead {
        NewLead {
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            email: Some(format!("{}@example.com", key)),
            company: Some("Analytical".into()),
            title: None,
            linkedin_url: None,
            dedupe_key: key.to_string(),
            raw_data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryStore::new();
        let job = Job::new(JobType::FetchLeads, Some(Uuid::new_v4()), None, Utc::now());
        store.insert_job(&job).await.unwrap();

        assert!(store.claim_job(job.id).await.unwrap().is_some());
        assert!(store.claim_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = InMemoryStore::new();
        let job = Job::new(JobType::EnrichLead, None, None, Utc::now());
        store.insert_job(&job).await.unwrap();

        let change = JobStatusChange::to(JobStatus::Completed);
        let missed = store
            .transition_job(job.id, &[JobStatus::Processing], &change)
            .await
            .unwrap();
        assert!(missed.is_none());

        let hit = store
            .transition_job(job.id, &[JobStatus::Pending], &change)
            .await
            .unwrap();
        assert_eq!(hit.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_upsert_leads_dedupes_per_campaign() {
        let store = InMemoryStore::new();
        let campaign = Uuid::new_v4();
        let first = store
            .upsert_leads(campaign, &[new_lead("a"), new_lead("b"), new_lead("a")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let again = store.upsert_leads(campaign, &[new_lead("b")]).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(store.list_leads(campaign).await.unwrap().len(), 2);

        let other = store.upsert_leads(Uuid::new_v4(), &[new_lead("a")]).await.unwrap();
        assert_ne!(other[0].id, first[0].id);
    }
}
