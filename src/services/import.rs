use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::job::{Durability, ImportOutcome, Job, JobResult};

/// Persists conversion output. Implementations must be idempotent per job id.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn upsert(&self, job: &Job, result: &JobResult) -> Result<ImportOutcome, ImportError>;

    async fn health_check(&self) -> Result<(), ImportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Database unreachable: {0}")]
    Connectivity(#[source] sqlx::Error),

    #[error("Import rejected: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl ImportError {
    /// Whether broker-level redelivery could plausibly succeed.
    pub fn should_requeue(&self) -> bool {
        !matches!(self, ImportError::Validation(_))
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ) {
            return ImportError::Connectivity(err);
        }

        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());
        let Some(sqlstate) = code else {
            return ImportError::Database(err);
        };

        // SQLSTATE class 22 is a data exception, 23 an integrity violation,
        // 08 a connection exception.
        if sqlstate.starts_with("22") || sqlstate.starts_with("23") {
            ImportError::Validation(err.to_string())
        } else if sqlstate.starts_with("08") {
            ImportError::Connectivity(err)
        } else {
            ImportError::Database(err)
        }
    }
}

/// Checks a result before it is written.
pub fn validate_result(job: &Job, result: &JobResult) -> Result<(), ImportError> {
    if result.job_id != job.id {
        return Err(ImportError::Validation(format!(
            "result belongs to job {} not {}",
            result.job_id, job.id
        )));
    }
    if result.artifacts.is_empty() {
        return Err(ImportError::Validation(
            "conversion produced no artifacts".to_string(),
        ));
    }
    Ok(())
}

/// PostgreSQL-backed import store.
pub struct PgImportStore {
    pool: PgPool,
    durability: Durability,
}

impl PgImportStore {
    pub fn new(pool: PgPool, durability: Durability) -> Self {
        Self { pool, durability }
    }
}

#[async_trait]
impl ImportStore for PgImportStore {
    async fn upsert(&self, job: &Job, result: &JobResult) -> Result<ImportOutcome, ImportError> {
        validate_result(job, result)?;

        let mut tx = self.pool.begin().await?;
        queries::set_durability(&mut tx, self.durability).await?;
        let inserted = queries::upsert_import(&mut tx, job, result, self.durability).await?;
        tx.commit().await?;

        tracing::info!(
            job_id = %job.id,
            inserted,
            durability = %self.durability,
            artifacts = result.artifacts.len(),
            "Import persisted"
        );

        Ok(ImportOutcome {
            job_id: job.id.clone(),
            durability: self.durability,
            artifact_count: result.artifacts.len(),
            asset_dir: result.output_dir.clone(),
            inserted,
        })
    }

    async fn health_check(&self) -> Result<(), ImportError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
