//! Postgres-backed job repository.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED`, so any number of worker
//! processes can share one table without handing out the same job twice.
//! Status updates are conditional on the expected status and claimant.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//!
//! ## Blocking
//!
//! `JobRepository` is synchronous. Every call drives the query to completion
//! on the runtime captured at construction, so it must be made from outside
//! that runtime's async context: a worker thread, or `spawn_blocking`.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::{JobRepository, JobStats, JobStoreError, StatusGuard};
use super::types::{Job, JobId, JobStatus, RunId, WorkerId};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempt, max_attempts, run_id, \
                           claimed_by, last_error, scheduled_at, created_at, updated_at";

/// Job repository on a Postgres `jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Connect using the current tokio runtime.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the `jobs` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn decode(row: &PgRow) -> Result<Job, JobStoreError> {
        let row = JobRow::from_row(row)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))?;
        row.try_into()
    }
}

impl JobRepository for PostgresJobRepository {
    #[instrument(skip_all, fields(job_id = %job.id))]
    fn insert_job(&self, job: &Job) -> Result<(), JobStoreError> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        self.block_on(
            sqlx::query(&sql)
                .bind(*job.id.as_uuid())
                .bind(&job.job_type)
                .bind(&job.payload)
                .bind(job.status.as_str())
                .bind(to_db_int(job.attempt)?)
                .bind(to_db_int(job.max_attempts)?)
                .bind(job.run_id.as_ref().map(RunId::as_str))
                .bind(job.claimed_by.as_ref().map(WorkerId::as_str))
                .bind(job.last_error.as_deref())
                .bind(job.scheduled_at)
                .bind(job.created_at)
                .bind(job.updated_at)
                .execute(&self.pool),
        )
        .map_err(|e| match map_sqlx_error("insert_job", e) {
            JobStoreError::AlreadyExists(_) => JobStoreError::AlreadyExists(job.id),
            other => other,
        })?;
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = self
            .block_on(
                sqlx::query(&sql)
                    .bind(*job_id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(Self::decode).transpose()
    }

    #[instrument(skip_all, fields(worker = %worker_id))]
    fn select_claimable_job(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET status = 'claimed', claimed_by = $1, updated_at = $2 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND scheduled_at <= $2 \
                 ORDER BY created_at, id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .block_on(
                sqlx::query(&sql)
                    .bind(worker_id.as_str())
                    .bind(now)
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("select_claimable_job", e))?;

        let job = row.as_ref().map(Self::decode).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, "claimed job row");
        }
        Ok(job)
    }

    #[instrument(skip_all, fields(job_id = %job.id, status = %job.status))]
    fn update_job_status(&self, job: &Job, expected: &StatusGuard) -> Result<(), JobStoreError> {
        let result = self
            .block_on(
                sqlx::query(
                    "UPDATE jobs SET status = $2, attempt = $3, claimed_by = $4, \
                     last_error = $5, scheduled_at = $6, updated_at = $7 \
                     WHERE id = $1 AND status = $8 AND claimed_by IS NOT DISTINCT FROM $9",
                )
                .bind(*job.id.as_uuid())
                .bind(job.status.as_str())
                .bind(to_db_int(job.attempt)?)
                .bind(job.claimed_by.as_ref().map(WorkerId::as_str))
                .bind(job.last_error.as_deref())
                .bind(job.scheduled_at)
                .bind(job.updated_at)
                .bind(expected.status.as_str())
                .bind(expected.claimed_by.as_ref().map(WorkerId::as_str))
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("update_job_status", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_job(job.id)? {
            Some(_) => Err(JobStoreError::Conflict(job.id)),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at, id \
             LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .block_on(
                sqlx::query(&sql)
                    .bind(status.map(|s| s.as_str()))
                    .bind(limit)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(Self::decode).collect()
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = self
            .block_on(
                sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let status = parse_status(&status)?;
            let count = usize::try_from(count).unwrap_or(0);
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Claimed => stats.claimed = count,
                JobStatus::Succeeded => stats.succeeded = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }
}

struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempt: i32,
    max_attempts: i32,
    run_id: Option<String>,
    claimed_by: Option<String>,
    last_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            run_id: row.try_get("run_id")?,
            claimed_by: row.try_get("claimed_by")?,
            last_error: row.try_get("last_error")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt =
            |what: &str| JobStoreError::Storage(format!("corrupt job row {}: {}", row.id, what));
        Ok(Job {
            id: JobId::from_uuid(row.id),
            status: parse_status(&row.status)?,
            attempt: u32::try_from(row.attempt).map_err(|_| corrupt("negative attempt"))?,
            max_attempts: u32::try_from(row.max_attempts)
                .map_err(|_| corrupt("negative max_attempts"))?,
            run_id: row
                .run_id
                .map(RunId::new)
                .transpose()
                .map_err(|_| corrupt("blank run_id"))?,
            claimed_by: row
                .claimed_by
                .map(WorkerId::new)
                .transpose()
                .map_err(|_| corrupt("blank claimed_by"))?,
            job_type: row.job_type,
            payload: row.payload,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_status(s: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::parse(s).ok_or_else(|| JobStoreError::Storage(format!("unknown job status: {}", s)))
}

fn to_db_int(value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| {
            JobStoreError::Storage(format!("value {} does not fit an INTEGER column", value))
        })
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Only inserts can hit the primary key; the caller fills in the id.
                Some("23505") => JobStoreError::AlreadyExists(JobId::from_uuid(Uuid::nil())),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}
