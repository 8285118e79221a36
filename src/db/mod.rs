use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::image::{ImageRecord, NewImageEntry};
use crate::models::job::{EntryOutcome, JobStatus, JobSummary, JobTicket};
use crate::services::store::{JobStore, StoreError};

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// [`JobStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(queries::ping(&self.pool).await?)
    }

    async fn create_job(
        &self,
        ticket: &JobTicket,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        queries::insert_ticket(&self.pool, ticket).await?;
        Ok(queries::insert_images(&self.pool, &ticket.user_id, &ticket.job_id, entries).await)
    }

    async fn append_images(
        &self,
        user_id: &str,
        job_id: &str,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        queries::get_ticket(&self.pool, user_id, job_id).await?;
        Ok(queries::insert_images(&self.pool, user_id, job_id, entries).await)
    }

    async fn find_ticket(&self, user_id: &str, job_id: &str) -> Result<JobTicket, StoreError> {
        queries::get_ticket(&self.pool, user_id, job_id).await
    }

    async fn set_status(
        &self,
        user_id: &str,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        queries::update_status(&self.pool, user_id, job_id, status).await
    }

    async fn job_images(&self, user_id: &str, job_id: &str) -> Result<Vec<ImageRecord>, StoreError> {
        queries::get_ticket(&self.pool, user_id, job_id).await?;
        Ok(queries::get_job_images(&self.pool, user_id, job_id).await?)
    }

    async fn update_images(
        &self,
        user_id: &str,
        job_id: &str,
        updates: &[Map<String, Value>],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        queries::get_ticket(&self.pool, user_id, job_id).await?;
        Ok(queries::merge_updates(&self.pool, user_id, job_id, updates).await)
    }

    async fn delete_job(&self, user_id: &str, job_id: &str) -> Result<(), StoreError> {
        queries::delete_job(&self.pool, user_id, job_id).await
    }

    async fn list_jobs(&self, user_id: &str) -> Result<Vec<JobSummary>, StoreError> {
        queries::list_jobs(&self.pool, user_id).await
    }

    async fn images_by_file(&self, files: &[String]) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(queries::get_images_by_file(&self.pool, files).await?)
    }
}
