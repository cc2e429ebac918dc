//! Postgres-backed job store.
//!
//! One row per job. `input`, `report`, `sources` and `error` are JSONB blobs;
//! status and stage are text columns guarded by CHECK constraints. Listing
//! reads only the summary columns, never the report or sources bodies.
//!
//! ## Compare-and-swap
//!
//! `transition` runs in a transaction: `SELECT ... FOR UPDATE` locks the row,
//! the lifecycle rules are applied in Rust via `Job::transitioned`, and the
//! new state is written back before commit. Concurrent writers to the same
//! job serialize on the row lock; the loser sees the winner's status and gets
//! `Conflict`. Writers to different jobs never contend.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `InvalidTransition` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use gitgauge_core::{ErrorKind, Job, JobError, JobId, JobInput, JobPatch, JobStatus, JobSummary, PipelineStage, Report};

use super::clock::{Clock, SystemClock};
use super::store::{JobStore, JobStoreError};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id            UUID PRIMARY KEY,
    status        TEXT NOT NULL CHECK (status IN ('queued', 'running', 'completed', 'failed')),
    stage         TEXT NULL CHECK (stage IN ('fetching', 'generating', 'persisting')),
    github_username TEXT NOT NULL,
    input         JSONB NOT NULL,
    report        JSONB NULL,
    sources       JSONB NULL,
    error         JSONB NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    generated_at  TIMESTAMPTZ NULL,
    CHECK ((status = 'completed') = (report IS NOT NULL)),
    CHECK ((status = 'failed') = (error IS NOT NULL))
);
ALTER TABLE analysis_jobs ADD COLUMN IF NOT EXISTS sources JSONB NULL;
CREATE INDEX IF NOT EXISTS analysis_jobs_created_at_idx ON analysis_jobs (created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS analysis_jobs_active_updated_idx
    ON analysis_jobs (updated_at) WHERE status IN ('queued', 'running');
"#;

const JOB_COLUMNS: &str =
    "id, status, stage, input, report, sources, error, attempt_count, created_at, updated_at, generated_at";

const SUMMARY_COLUMNS: &str = "id, status, stage, github_username, error->>'kind' AS error_kind, \
     attempt_count, created_at, updated_at, generated_at";

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore").finish_non_exhaustive()
    }
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, input), fields(github_username = %input.github_username()), err)]
    async fn create(&self, input: JobInput) -> Result<Job, JobStoreError> {
        let job = Job::new(JobId::new(), input, self.clock.now());
        let input_json = to_json("input", &job.input)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs
                (id, status, stage, github_username, input, attempt_count, created_at, updated_at)
            VALUES ($1, $2, NULL, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.input.github_username())
        .bind(input_json)
        .bind(job.attempt_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<JobSummary>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM analysis_jobs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(summary_from_row).collect()
    }

    #[instrument(
        skip(self, patch),
        fields(job_id = %id, expected = %expected, next = %next, fence = ?patch.expected_attempt),
        err
    )]
    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transition.begin", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition.select", e))?
        .ok_or(JobStoreError::NotFound(id))?;

        let current = job_from_row(&row)?;
        let updated = current
            .transitioned(expected, next, patch, self.clock.now())
            .map_err(JobStoreError::from_domain)?;

        let report = updated.report.as_ref().map(|r| to_json("report", r)).transpose()?;
        let sources = updated.sources.clone();
        let error = updated.error.as_ref().map(|e| to_json("error", e)).transpose()?;

        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2, stage = $3, report = $4, sources = $5, error = $6,
                attempt_count = $7, updated_at = $8, generated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(updated.status.as_str())
        .bind(updated.stage.map(PipelineStage::as_str))
        .bind(report)
        .bind(sources)
        .bind(error)
        .bind(updated.attempt_count as i32)
        .bind(updated.updated_at)
        .bind(updated.generated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition.update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("transition.commit", e))?;

        Ok(updated)
    }

    #[instrument(skip(self), err)]
    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM analysis_jobs
            WHERE status IN ('queued', 'running') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("list_stale.decode", e))
            })
            .collect()
    }
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("encoding {what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, JobStoreError> {
    serde_json::from_value(value).map_err(|e| JobStoreError::Storage(format!("decoding {what}: {e}")))
}

fn decode(e: sqlx::Error) -> JobStoreError {
    map_sqlx_error("decode", e)
}

fn status_from_row(row: &PgRow) -> Result<JobStatus, JobStoreError> {
    let status: String = row.try_get("status").map_err(decode)?;
    JobStatus::parse(&status).ok_or_else(|| JobStoreError::Storage(format!("unknown status `{status}`")))
}

fn stage_from_row(row: &PgRow) -> Result<Option<PipelineStage>, JobStoreError> {
    let stage: Option<String> = row.try_get("stage").map_err(decode)?;
    stage
        .map(|s| PipelineStage::parse(&s).ok_or_else(|| JobStoreError::Storage(format!("unknown stage `{s}`"))))
        .transpose()
}

fn attempt_from_row(row: &PgRow) -> Result<u32, JobStoreError> {
    let attempt_count: i32 = row.try_get("attempt_count").map_err(decode)?;
    u32::try_from(attempt_count)
        .map_err(|_| JobStoreError::Storage(format!("negative attempt_count {attempt_count}")))
}

fn summary_from_row(row: &PgRow) -> Result<JobSummary, JobStoreError> {
    let error_kind: Option<String> = row.try_get("error_kind").map_err(decode)?;
    Ok(JobSummary {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        status: status_from_row(row)?,
        github_username: row.try_get("github_username").map_err(decode)?,
        stage: stage_from_row(row)?,
        attempt_count: attempt_from_row(row)?,
        error_kind: error_kind
            .map(|k| from_json::<ErrorKind>("error kind", serde_json::Value::String(k)))
            .transpose()?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        generated_at: row.try_get("generated_at").map_err(decode)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let report: Option<serde_json::Value> = row.try_get("report").map_err(decode)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        status: status_from_row(row)?,
        input: from_json::<JobInput>("input", row.try_get("input").map_err(decode)?)?,
        report: report.map(|r| from_json::<Report>("report", r)).transpose()?,
        sources: row.try_get("sources").map_err(decode)?,
        error: error.map(|e| from_json::<JobError>("error", e)).transpose()?,
        stage: stage_from_row(row)?,
        attempt_count: attempt_from_row(row)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        generated_at: row.try_get("generated_at").map_err(decode)?,
    })
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some("23514") => JobStoreError::InvalidTransition(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
