use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::models::job::{Durability, Job, JobResult};

/// Persisted import row.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRecord {
    pub job_id: String,
    pub kind: String,
    pub target_project: Option<String>,
    pub target_revision: Option<String>,
    pub member_revisions: serde_json::Value,
    pub artifacts: serde_json::Value,
    pub output_dir: String,
    pub log_excerpt: String,
    pub durability: String,
    pub imported_at: DateTime<Utc>,
}

/// Apply the write durability to the current transaction.
pub async fn set_durability(
    tx: &mut Transaction<'_, Postgres>,
    durability: Durability,
) -> Result<(), sqlx::Error> {
    // SET cannot take bind parameters; the value comes from a closed enum.
    let statement = format!("SET LOCAL synchronous_commit = {}", durability.as_setting());
    sqlx::query(&statement).execute(&mut **tx).await?;
    Ok(())
}

/// Insert or overwrite the import row for a job. Returns true when the row was new.
///
/// `imported_at` is only written on first insert, so repeating the call with
/// the same result leaves the row unchanged.
pub async fn upsert_import(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    result: &JobResult,
    durability: Durability,
) -> Result<bool, sqlx::Error> {
    let artifacts: Vec<String> = result
        .artifacts
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    let row = sqlx::query(
        r#"
        INSERT INTO conversion_imports
            (job_id, kind, target_project, target_revision, member_revisions,
             artifacts, output_dir, log_excerpt, durability, imported_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
        ON CONFLICT (job_id) DO UPDATE
        SET kind = EXCLUDED.kind,
            target_project = EXCLUDED.target_project,
            target_revision = EXCLUDED.target_revision,
            member_revisions = EXCLUDED.member_revisions,
            artifacts = EXCLUDED.artifacts,
            output_dir = EXCLUDED.output_dir,
            log_excerpt = EXCLUDED.log_excerpt,
            durability = EXCLUDED.durability
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .bind(&job.id)
    .bind(job.kind.to_string())
    .bind(job.target_project.as_deref())
    .bind(job.target_revision.as_deref())
    .bind(serde_json::json!(job.member_revisions))
    .bind(serde_json::json!(artifacts))
    .bind(result.output_dir.display().to_string())
    .bind(&result.log_excerpt)
    .bind(durability.as_setting())
    .fetch_one(&mut **tx)
    .await?;

    row.try_get("inserted")
}

/// Get the import row for a job
pub async fn get_import(pool: &PgPool, job_id: &str) -> Result<Option<ImportRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, kind, target_project, target_revision, member_revisions,
               artifacts, output_dir, log_excerpt, durability, imported_at
        FROM conversion_imports
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<ImportRecord, sqlx::Error> {
        Ok(ImportRecord {
            job_id: r.try_get("job_id")?,
            kind: r.try_get("kind")?,
            target_project: r.try_get("target_project")?,
            target_revision: r.try_get("target_revision")?,
            member_revisions: r.try_get("member_revisions")?,
            artifacts: r.try_get("artifacts")?,
            output_dir: r.try_get("output_dir")?,
            log_excerpt: r.try_get("log_excerpt")?,
            durability: r.try_get("durability")?,
            imported_at: r.try_get("imported_at")?,
        })
    })
    .transpose()
}

/// Count import rows for a job (used to check idempotency)
pub async fn count_imports(pool: &PgPool, job_id: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM conversion_imports WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    row.try_get("n")
}
