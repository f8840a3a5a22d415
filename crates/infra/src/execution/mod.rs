//! Job execution on this replica.
//!
//! ## Design
//!
//! - Claimed jobs are submitted to a fixed-size worker pool
//! - Every submitted job is tracked under its id until the watcher has
//!   persisted its terminal state
//! - Cancellation is cooperative: bodies observe a `CancellationToken`
//! - Bodies never touch the job record; all state changes after QUEUED are
//!   applied by the task wrapper (RUNNING) and the watcher (terminal)
//!
//! ## Components
//!
//! - `ExecutionService`: submit, admission check, cancel, status
//! - `ExecutionWatcher`: periodic reconciliation of finished handles
//! - `WorkerPool`: the worker threads
//! - `ExecutionHandle`: per-job completion cell + cancellation token

mod handle;
mod pool;
mod service;
mod watcher;

pub use handle::{ExecutionHandle, ExecutionOutcome};
pub use pool::{PoolClosed, WorkerPool};
pub use service::{ExecutionEntry, ExecutionService, ExecutionStatus, SubmitError};
pub use watcher::{ExecutionWatcher, ReconcileReport, GENERIC_FAILURE_RESULT};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use pds_core::{DomainError, JobId, PdsJob};

use crate::jobs::{JobStore, JobStoreError};

/// What an execution body hands back when it ran to completion.
///
/// `failed` is the body's own verdict (e.g. the scanner exited non-zero) and
/// is distinct from a body that returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub result: String,
    pub failed: bool,
}

impl ExecutionResult {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            failed: false,
        }
    }

    pub fn failure(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            failed: true,
        }
    }
}

/// Error escaping an execution body (or its task wrapper).
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("execution panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything a body may know about the job it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    job_id: JobId,
    configuration: String,
    token: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job_id: JobId, configuration: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            job_id,
            configuration: configuration.into(),
            token,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The job's opaque configuration blob.
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested; use with `?` at
    /// checkpoints inside long-running bodies.
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }
}

/// The unit of work run on a worker thread for one job.
pub type ExecutionBody =
    Box<dyn FnOnce(&ExecutionContext) -> Result<ExecutionResult, ExecutionError> + Send + 'static>;

/// Produces the execution body for a claimed job.
pub trait ExecutionBodyFactory: Send + Sync {
    fn create_body(&self, job: &PdsJob) -> ExecutionBody;
}

impl<F> ExecutionBodyFactory for F
where
    F: Fn(&PdsJob) -> ExecutionBody + Send + Sync,
{
    fn create_body(&self, job: &PdsJob) -> ExecutionBody {
        self(job)
    }
}

/// Attempts for a read-modify-write that races other writers of the record.
const UPDATE_ATTEMPTS: u32 = 3;

/// Load the latest record, apply `change` and save it, reloading on version
/// conflicts.
///
/// `change` returning `Ok(false)` means "nothing to do" and skips the write.
/// Returns `Ok(None)` when the record does not exist.
pub(crate) fn update_job_record<S, F>(
    store: &S,
    job_id: JobId,
    mut change: F,
) -> Result<Option<PdsJob>, ExecutionError>
where
    S: JobStore + ?Sized,
    F: FnMut(&mut PdsJob) -> Result<bool, DomainError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut job) = store.find_by_id(job_id)? else {
            return Ok(None);
        };
        if !change(&mut job)? {
            return Ok(Some(job));
        }
        match store.save(&job) {
            Ok(saved) => return Ok(Some(saved)),
            Err(JobStoreError::Concurrency(msg)) if attempt < UPDATE_ATTEMPTS => {
                debug!(job_id = %job_id, attempt, error = %msg, "job record changed concurrently, reloading");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
