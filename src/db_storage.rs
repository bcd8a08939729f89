use crate::errors::{AppError, ResultExt};
use crate::models::{
    Campaign, CampaignStatus, CampaignStatusChange, Job, JobFilter, JobStatus, JobStatusChange,
    Lead, LeadStageUpdate, NewLead, ThirdPartyService,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// PostgreSQL-backed [`Store`].
///
/// Status changes are single `UPDATE ... WHERE status = ...` statements, so the
/// compare-and-set is enforced by the database row lock.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_strings(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, name, description, organization_id, file_name, total_records, url,
                status, status_message, status_error, paused_service, instantly_campaign_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.description)
        .bind(&campaign.organization_id)
        .bind(&campaign.file_name)
        .bind(campaign.total_records)
        .bind(&campaign.url)
        .bind(campaign.status)
        .bind(&campaign.status_message)
        .bind(&campaign.status_error)
        .bind(campaign.paused_service)
        .bind(&campaign.instantly_campaign_id)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert campaign")?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, AppError> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load campaign {}", id))
    }

    async fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<Campaign>, AppError> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list campaigns")
    }

    async fn list_paused_campaigns(
        &self,
        service: Option<ThirdPartyService>,
    ) -> Result<Vec<Campaign>, AppError> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'PAUSED'
              AND ($1::text IS NULL OR paused_service = $1)
            ORDER BY created_at
            "#,
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list paused campaigns")
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        change: &CampaignStatusChange,
    ) -> Result<Option<Campaign>, AppError> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $3,
                status_message = $4,
                status_error = $5,
                paused_service = $6,
                fetch_completed_at = COALESCE($7, fetch_completed_at),
                completed_at = COALESCE($8, completed_at),
                failed_at = COALESCE($9, failed_at),
                updated_at = now()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(change.status)
        .bind(&change.status_message)
        .bind(&change.status_error)
        .bind(change.paused_service)
        .bind(change.fetch_completed_at)
        .bind(change.completed_at)
        .bind(change.failed_at)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to move campaign {} to {}", id, change.status))
    }

    async fn set_instantly_campaign_id(
        &self,
        id: Uuid,
        external_id: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE campaigns SET instantly_campaign_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .context("Failed to store Instantly campaign id")?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Campaign {} not found", id)));
        }
        Ok(())
    }

    async fn organization_exists(&self, organization_id: &str) -> Result<bool, AppError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up organization")?;
        Ok(row.is_some())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, campaign_id, lead_id, job_type, name, status, task_id, result, error,
                attempts, paused_service, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.campaign_id)
        .bind(job.lead_id)
        .bind(job.job_type)
        .bind(&job.name)
        .bind(job.status)
        .bind(&job.task_id)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.attempts)
        .bind(job.paused_service)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load job {}", id))
    }

    async fn set_job_task_id(&self, id: Uuid, task_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE jobs SET task_id = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to store job task id")?;
        Ok(())
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET status = 'PROCESSING', updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE id = $1 AND status = 'PENDING'
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to claim job {}", id))
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        change: &JobStatusChange,
    ) -> Result<Option<Job>, AppError> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = $3,
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                attempts = COALESCE($6, attempts),
                paused_service = $7,
                completed_at = COALESCE($8, completed_at),
                task_id = CASE WHEN $3 = 'PENDING' THEN NULL ELSE task_id END,
                updated_at = now()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_strings(from))
        .bind(change.status)
        .bind(&change.result)
        .bind(&change.error)
        .bind(change.attempts)
        .bind(change.paused_service)
        .bind(change.completed_at)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to move job {} to {}", id, change.status))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, AppError> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM jobs WHERE TRUE");
        if !filter.statuses.is_empty() {
            query
                .push(" AND status = ANY(")
                .push_bind(status_strings(&filter.statuses))
                .push(")");
        }
        if !filter.job_types.is_empty() {
            let types: Vec<String> = filter
                .job_types
                .iter()
                .map(|t| t.as_str().to_string())
                .collect();
            query.push(" AND job_type = ANY(").push_bind(types).push(")");
        }
        if let Some(campaign_id) = filter.campaign_id {
            query.push(" AND campaign_id = ").push_bind(campaign_id);
        }
        if let Some(lead_id) = filter.lead_id {
            query.push(" AND lead_id = ").push_bind(lead_id);
        }
        if let Some(service) = filter.paused_service {
            query.push(" AND paused_service = ").push_bind(service);
        }
        if filter.unqueued {
            query.push(" AND task_id IS NULL");
        }
        query.push(" ORDER BY created_at");

        query
            .build_query_as::<Job>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list jobs")
    }

    async fn delete_jobs(
        &self,
        campaign_id: Option<Uuid>,
        created_before: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>, AppError> {
        sqlx::query_as::<_, Job>(
            r#"
            DELETE FROM jobs
            WHERE ($1::uuid IS NULL OR campaign_id = $1)
              AND created_at < $2
              AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(created_before)
        .bind(status_strings(statuses))
        .fetch_all(&self.pool)
        .await
        .context("Failed to delete old jobs")
    }

    async fn upsert_leads(
        &self,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Lead>, AppError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for new_lead in leads {
            let lead = new_lead.clone().into_lead(campaign_id, now);
            sqlx::query(
                r#"
                INSERT INTO leads (
                    id, campaign_id, first_name, last_name, email, company, title,
                    linkedin_url, dedupe_key, raw_data, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
                ON CONFLICT (campaign_id, dedupe_key) DO NOTHING
                "#,
            )
            .bind(lead.id)
            .bind(campaign_id)
            .bind(&lead.first_name)
            .bind(&lead.last_name)
            .bind(&lead.email)
            .bind(&lead.company)
            .bind(&lead.title)
            .bind(&lead.linkedin_url)
            .bind(&lead.dedupe_key)
            .bind(&lead.raw_data)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert lead")?;
        }

        let keys: Vec<String> = leads.iter().map(|l| l.dedupe_key.clone()).collect();
        let stored = sqlx::query_as::<_, Lead>(
            r#"
            SELECT * FROM leads
            WHERE campaign_id = $1 AND dedupe_key = ANY($2)
            ORDER BY created_at, id
            "#,
        )
        .bind(campaign_id)
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to reload leads")?;

        tx.commit().await?;

        tracing::debug!(
            "Stored {} leads ({} submitted) for campaign {}",
            stored.len(),
            leads.len(),
            campaign_id
        );
        Ok(stored)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load lead {}", id))
    }

    async fn update_lead_stage(
        &self,
        id: Uuid,
        update: &LeadStageUpdate,
    ) -> Result<Option<Lead>, AppError> {
        let query = match update {
            LeadStageUpdate::EmailVerified(verified) => sqlx::query_as::<_, Lead>(
                "UPDATE leads SET email_verified = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(*verified),
            LeadStageUpdate::Enrichment(value) => sqlx::query_as::<_, Lead>(
                "UPDATE leads SET enrichment_results = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(value.clone()),
            LeadStageUpdate::EmailCopy(value) => sqlx::query_as::<_, Lead>(
                "UPDATE leads SET email_copy_gen_results = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(value.clone()),
            LeadStageUpdate::InstantlyRecord(value) => sqlx::query_as::<_, Lead>(
                "UPDATE leads SET instantly_lead_record = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(value.clone()),
            LeadStageUpdate::Error(message) => sqlx::query_as::<_, Lead>(
                "UPDATE leads SET last_error = $2, updated_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(message.clone()),
        };

        query
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to update lead {}", id))
    }

    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, AppError> {
        sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE campaign_id = $1 ORDER BY created_at, id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list leads")
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
