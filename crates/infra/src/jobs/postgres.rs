//! Postgres-backed job record store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | `create` with an id that is already stored |
//! | Database (other) | Any other | `Storage` | Constraint or type errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Version-guarded updates that touch zero rows are reported as
//! `Concurrency` (or `NotFound` when the record is gone).
//!
//! ## Claiming
//!
//! `claim_oldest_ready_to_start` runs `SELECT ... FOR UPDATE SKIP LOCKED`
//! followed by a version-guarded `UPDATE` in one transaction. Competing
//! replicas skip the locked row instead of waiting on it, so each job is
//! handed out at most once across the cluster.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{instrument, Span};

use pds_core::{JobId, JobState, PdsJob};

use super::store::{JobStore, JobStoreError};

/// Schema for the `pds_job` table.
pub const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS pds_job (
    uuid            UUID PRIMARY KEY,
    server_id       TEXT,
    owner           TEXT NOT NULL,
    state           TEXT NOT NULL,
    configuration   TEXT NOT NULL,
    result          TEXT,
    created         TIMESTAMPTZ NOT NULL,
    started         TIMESTAMPTZ,
    ended           TIMESTAMPTZ,
    version         BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS pds_job_state_created_idx ON pds_job (state, created);
CREATE INDEX IF NOT EXISTS pds_job_server_state_idx ON pds_job (server_id, state);
"#;

/// Postgres-backed job record store.
///
/// The [`JobStore`] trait is synchronous because it is called from the
/// engine's worker and watcher threads. The store remembers the tokio runtime
/// it was created on and drives its async queries with `block_on`, which is
/// valid from any thread that is not itself a runtime worker.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store bound to the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Storage(
                "PostgresJobStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the `pds_job` table and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_job(&self, job: PdsJob) -> Result<PdsJob, JobStoreError> {
        let mut stored = job;
        stored.version = 0;

        sqlx::query(
            r#"
            INSERT INTO pds_job (
                uuid, server_id, owner, state, configuration,
                result, created, started, ended, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
            "#,
        )
        .bind(stored.id.as_uuid())
        .bind(&stored.server_id)
        .bind(&stored.owner)
        .bind(stored.state.as_str())
        .bind(&stored.configuration)
        .bind(&stored.result)
        .bind(stored.created)
        .bind(stored.started)
        .bind(stored.ended)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(stored.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(stored)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_job(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pds_job WHERE uuid = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|r| JobRow::try_from(&r).and_then(PdsJob::try_from))
            .transpose()
    }

    /// Version-guarded update of every mutable column.
    #[instrument(skip(self, job), fields(job_id = %job.id, version = job.version), err)]
    pub async fn update_job(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError> {
        let next_version = job.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE pds_job
            SET server_id = $2,
                owner = $3,
                state = $4,
                configuration = $5,
                result = $6,
                started = $7,
                ended = $8,
                version = $9
            WHERE uuid = $1 AND version = $10
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.server_id)
        .bind(&job.owner)
        .bind(job.state.as_str())
        .bind(&job.configuration)
        .bind(&job.result)
        .bind(job.started)
        .bind(job.ended)
        .bind(to_db_version(next_version)?)
        .bind(to_db_version(job.version)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return match self.load_job(job.id).await? {
                None => Err(JobStoreError::NotFound(job.id)),
                Some(current) => Err(JobStoreError::Concurrency(format!(
                    "job {}: expected version {}, found {}",
                    job.id, job.version, current.version
                ))),
            };
        }

        let mut stored = job.clone();
        stored.version = next_version;
        Ok(stored)
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    pub async fn claim_next(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError> {
        let span = Span::current();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pds_job
            WHERE state = $1
            ORDER BY created ASC, uuid ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(JobState::ReadyToStart.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_ready_job", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            span.record("claimed", false);
            return Ok(None);
        };

        let mut job = PdsJob::try_from(JobRow::try_from(&row)?)?;
        job.mark_queued()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        job.server_id = Some(server_id.to_string());
        let next_version = job.version + 1;

        let updated = sqlx::query(
            r#"
            UPDATE pds_job
            SET state = $2, server_id = $3, version = $4
            WHERE uuid = $1 AND version = $5
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.state.as_str())
        .bind(server_id)
        .bind(to_db_version(next_version)?)
        .bind(to_db_version(job.version)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::Concurrency(format!(
                "job {} changed while being claimed",
                job.id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        job.version = next_version;
        span.record("claimed", true);
        Ok(Some(job))
    }

    #[instrument(skip(self), err)]
    pub async fn count_jobs(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM pds_job WHERE server_id = $1 AND state = $2",
        )
        .bind(server_id)
        .bind(state.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read total: {e}")))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM pds_job WHERE uuid = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }
}

const JOB_COLUMNS: &str =
    "uuid, server_id, owner, state, configuration, result, created, started, ended, version";

fn to_db_version(version: u64) -> Result<i64, JobStoreError> {
    i64::try_from(version)
        .map_err(|_| JobStoreError::Storage(format!("version {version} out of range")))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row type

#[derive(Debug)]
struct JobRow {
    uuid: uuid::Uuid,
    server_id: Option<String>,
    owner: String,
    state: String,
    configuration: String,
    result: Option<String>,
    created: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<&sqlx::postgres::PgRow> for JobRow {
    type Error = JobStoreError;

    fn try_from(row: &sqlx::postgres::PgRow) -> Result<Self, Self::Error> {
        let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job row: {e}"));
        Ok(JobRow {
            uuid: row.try_get("uuid").map_err(read)?,
            server_id: row.try_get("server_id").map_err(read)?,
            owner: row.try_get("owner").map_err(read)?,
            state: row.try_get("state").map_err(read)?,
            configuration: row.try_get("configuration").map_err(read)?,
            result: row.try_get("result").map_err(read)?,
            created: row.try_get("created").map_err(read)?,
            started: row.try_get("started").map_err(read)?,
            ended: row.try_get("ended").map_err(read)?,
            version: row.try_get("version").map_err(read)?,
        })
    }
}

impl TryFrom<JobRow> for PdsJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| JobStoreError::Storage(format!("job {}: {e}", row.uuid)))?;

        Ok(PdsJob {
            id: JobId::from_uuid(row.uuid),
            server_id: row.server_id,
            owner: row.owner,
            state,
            configuration: row.configuration,
            result: row.result,
            created: row.created,
            started: row.started,
            ended: row.ended,
            version: row.version.max(0) as u64,
        })
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, job: PdsJob) -> Result<PdsJob, JobStoreError> {
        self.runtime.block_on(self.insert_job(job))
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError> {
        self.runtime.block_on(self.load_job(job_id))
    }

    fn save(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError> {
        self.runtime.block_on(self.update_job(job))
    }

    fn claim_oldest_ready_to_start(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError> {
        self.runtime.block_on(self.claim_next(server_id))
    }

    fn count_by_server_and_state(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError> {
        self.runtime.block_on(self.count_jobs(server_id, state))
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.delete_job(job_id))
    }
}
