//! Postgres-backed job store.
//!
//! The `jobs` table is the durable substrate: a job survives a crash of the
//! process that submitted it as well as of the worker running it.
//!
//! ## Concurrency
//!
//! Every transition is a single conditional `UPDATE ... WHERE state = ...`, so
//! the database serializes racing workers and exactly one of them sees a row
//! come back. Claims use `FOR UPDATE SKIP LOCKED` so idle workers never block
//! on each other.
//!
//! ## Error Mapping
//!
//! | SQLx error | JobStoreError |
//! |------------|---------------|
//! | unique violation (`23505`) on insert | `AlreadyExists` |
//! | conditional update matched no row | `NotFound` or `Rejected` (re-derived from the stored row) |
//! | anything else | `Storage` |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::instrument;

use scribe_core::{DomainError, Job, JobId, JobInput, JobState, WorkerId};

use super::store::{ClaimedJob, JobStore, JobStoreError};

const JOB_COLUMNS: &str = "id, input, queue, state, attempt_count, result, error, last_failure, \
     worker_id, lease_expires_at, created_at, started_at, completed_at, updated_at";

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `jobs` table and its claim index if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id               UUID PRIMARY KEY,
                input            TEXT NOT NULL,
                queue            TEXT NOT NULL,
                state            TEXT NOT NULL
                    CHECK (state IN ('pending', 'running', 'succeeded', 'failed')),
                attempt_count    INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
                result           TEXT,
                error            TEXT,
                last_failure     TEXT,
                worker_id        UUID,
                lease_expires_at TIMESTAMPTZ,
                created_at       TIMESTAMPTZ NOT NULL,
                started_at       TIMESTAMPTZ,
                completed_at     TIMESTAMPTZ,
                updated_at       TIMESTAMPTZ NOT NULL,
                CHECK (result IS NULL OR error IS NULL)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_table", e))?;

        sqlx::query("ALTER TABLE jobs ADD COLUMN IF NOT EXISTS last_failure TEXT")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_last_failure_column", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (queue, state, created_at)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_claim_index", e))?;

        Ok(())
    }

    /// Work out why a conditional update matched nothing, by replaying the
    /// domain transition against the row as it is now.
    async fn rejection<F>(&self, job_id: JobId, replay: F) -> JobStoreError
    where
        F: FnOnce(&mut Job) -> Result<(), DomainError>,
    {
        match self.get(job_id).await {
            Ok(Some(mut job)) => match replay(&mut job) {
                Err(e) => JobStoreError::rejected(job_id, e),
                // The row changed between our update and this read.
                Ok(()) => JobStoreError::rejected(job_id, DomainError::NotOwner),
            },
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, input, queue, state, attempt_count, result, error, last_failure,
                worker_id, lease_expires_at, created_at, started_at, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.input.path().to_string_lossy().into_owned())
        .bind(&job.queue)
        .bind(job.state.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.result.as_deref())
        .bind(job.error.as_deref())
        .bind(job.last_failure.as_deref())
        .bind(job.worker_id.map(uuid::Uuid::from))
        .bind(job.lease_expires_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert_job", e)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker = %worker), err)]
    async fn start(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'running',
                worker_id = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(lease.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("start_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self
                .rejection(job_id, |job| {
                    let now = Utc::now();
                    job.start(worker, now, now)
                })
                .await),
        }
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim_next(
        &self,
        queue: &str,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id, state AS previous_state
                FROM jobs
                WHERE queue = $1
                  AND (state = 'pending'
                       OR (state = 'running'
                           AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())))
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET state = 'running',
                worker_id = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                started_at = COALESCE(j.started_at, NOW()),
                updated_at = NOW()
            FROM candidate c
            WHERE j.id = c.id
            RETURNING j.id, j.input, j.queue, j.state, j.attempt_count, j.result, j.error,
                      j.last_failure, j.worker_id, j.lease_expires_at, j.created_at, j.started_at,
                      j.completed_at, j.updated_at, c.previous_state
            "#,
        )
        .bind(queue)
        .bind(worker.as_uuid())
        .bind(lease.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next_job", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let previous: String = row
            .try_get("previous_state")
            .map_err(|e| map_sqlx_error("claim_next_job", e))?;
        Ok(Some(ClaimedJob {
            job: job_from_row(&row)?,
            resumed: previous == JobState::Running.as_str(),
        }))
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND worker_id = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat_job", e))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        Err(self
            .rejection(job_id, |job| {
                let now = Utc::now();
                job.heartbeat(worker, now, now)
            })
            .await)
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker = %worker), err)]
    async fn record_attempt(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    ) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET attempt_count = $3,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND worker_id = $2 AND attempt_count < $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(attempt as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_attempt", e))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        Err(self
            .rejection(job_id, |job| {
                job.ensure_owner(worker)?;
                job.record_attempt(attempt, Utc::now())
            })
            .await)
    }

    #[instrument(skip(self, failure), fields(job_id = %job_id, worker = %worker), err)]
    async fn record_failure(
        &self,
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        failure: &str,
    ) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET last_failure = $4,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND worker_id = $2 AND attempt_count = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(attempt as i32)
        .bind(failure)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        Err(self
            .rejection(job_id, |job| {
                job.ensure_owner(worker)?;
                job.record_failure(attempt, failure, Utc::now())
            })
            .await)
    }

    #[instrument(skip(self, result), fields(job_id = %job_id, worker = %worker), err)]
    async fn complete(
        &self,
        job_id: JobId,
        worker: WorkerId,
        result: &str,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'succeeded',
                result = $3,
                lease_expires_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(result)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self
                .rejection(job_id, |job| {
                    job.ensure_owner(worker)?;
                    job.complete(result, Utc::now())
                })
                .await),
        }
    }

    #[instrument(skip(self, error), fields(job_id = %job_id, worker = %worker), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'failed',
                error = $3,
                lease_expires_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(worker.as_uuid())
        .bind(error)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self
                .rejection(job_id, |job| {
                    job.ensure_owner(worker)?;
                    job.fail(error, Utc::now())
                })
                .await),
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let read = |e: sqlx::Error| map_sqlx_error("decode_job_row", e);

    let state: String = row.try_get("state").map_err(read)?;
    let state = state
        .parse::<JobState>()
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;
    let input: String = row.try_get("input").map_err(read)?;
    let input = JobInput::new(PathBuf::from(input))
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(read)?;
    let worker_id: Option<uuid::Uuid> = row.try_get("worker_id").map_err(read)?;
    let id: uuid::Uuid = row.try_get("id").map_err(read)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        input,
        queue: row.try_get("queue").map_err(read)?,
        state,
        attempt_count: attempt_count.max(0) as u32,
        result: row.try_get("result").map_err(read)?,
        error: row.try_get("error").map_err(read)?,
        last_failure: row.try_get("last_failure").map_err(read)?,
        worker_id: worker_id.map(WorkerId::from_uuid),
        lease_expires_at: row.try_get::<Option<DateTime<Utc>>, _>("lease_expires_at").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        started_at: row.try_get("started_at").map_err(read)?,
        completed_at: row.try_get("completed_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
