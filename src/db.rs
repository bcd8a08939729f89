use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 10;

/// Postgres pool holding campaigns, jobs and leads.
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        tracing::info!("✓ Connected to Postgres (pool size {})", MAX_CONNECTIONS);

        Ok(Self { pool })
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("✓ Database migrations applied");
        Ok(())
    }
}
