//! Job operations offered to clients (create, mark ready, status, result,
//! cancel).
//!
//! The transport layer on top of this only translates: `NotFound` and
//! `IllegalState` are client errors, `NotAcceptable` is a rejected payload.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pds_core::{DomainError, JobId, JobState, JobStatus, PdsJob};

use crate::config::ServerConfiguration;
use crate::execution::{update_job_record, ExecutionError, ExecutionService};

use super::configuration::JobConfiguration;
use super::store::{JobStore, JobStoreError};

/// Job service error.
#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("configuration invalid: {0}")]
    NotAcceptable(String),
    #[error(transparent)]
    IllegalState(DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<DomainError> for JobServiceError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound(id) => JobServiceError::NotFound(id),
            DomainError::Validation(msg) => JobServiceError::NotAcceptable(msg),
            other => JobServiceError::IllegalState(other),
        }
    }
}

impl From<ExecutionError> for JobServiceError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Store(e) => JobServiceError::Store(e),
            ExecutionError::Domain(e) => e.into(),
            other => JobServiceError::Store(JobStoreError::Storage(other.to_string())),
        }
    }
}

/// Answer to a successful create.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreateResult {
    pub job_id: JobId,
}

pub struct JobService<S> {
    store: S,
    server: Arc<ServerConfiguration>,
    execution: Arc<ExecutionService<S>>,
}

impl<S> JobService<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S, server: Arc<ServerConfiguration>, execution: Arc<ExecutionService<S>>) -> Self {
        Self {
            store,
            server,
            execution,
        }
    }

    /// Validate `configuration` and store a new CREATED job owned by `owner`.
    pub fn create_job(&self, owner: &str, configuration: &JobConfiguration) -> Result<JobCreateResult, JobServiceError> {
        if let Some(message) = configuration.validation_error() {
            warn!(message = %message, "pds job configuration not valid");
            return Err(JobServiceError::NotAcceptable(message));
        }
        if self.server.product(&configuration.product_id).is_none() {
            let message = format!("product id '{}' is not supported by this server", configuration.product_id);
            warn!(message = %message, "pds job configuration not valid");
            return Err(JobServiceError::NotAcceptable(message));
        }

        let json = configuration
            .to_json()
            .map_err(|e| JobServiceError::NotAcceptable(e.to_string()))?;

        let mut job = PdsJob::new(JobId::new(), owner, json);
        job.server_id = Some(self.server.server_id.clone());
        let job = self.store.create(job)?;

        info!(job_id = %job.id, owner, product_id = %configuration.product_id, "created job");
        Ok(JobCreateResult { job_id: job.id })
    }

    /// Owner signals that all inputs are staged; the job becomes claimable.
    pub fn mark_ready_to_start(&self, job_id: JobId) -> Result<(), JobServiceError> {
        update_job_record(&self.store, job_id, |job| job.mark_ready_to_start().map(|_| true))?
            .ok_or(JobServiceError::NotFound(job_id))?;
        Ok(())
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus, JobServiceError> {
        Ok(self.find(job_id)?.status())
    }

    /// The result of a DONE job; any other state is an illegal-state error.
    pub fn job_result(&self, job_id: JobId) -> Result<String, JobServiceError> {
        let job = self.find(job_id)?;
        Ok(job.result_if_done()?.to_string())
    }

    /// Admin view of whatever the job stored: the result of a DONE job or the
    /// failure text of a FAILED one. Any state is accepted; `None` when
    /// nothing was stored yet.
    pub fn job_result_or_failure_text(&self, job_id: JobId) -> Result<Option<String>, JobServiceError> {
        let job = self.find(job_id)?;
        debug!(job_id = %job_id, state = %job.state, "admin fetches job result or failure text");
        Ok(job.result)
    }

    /// Cancel a RUNNING job.
    ///
    /// Jobs already CANCEL_REQUESTED or CANCELED are ignored; any other state
    /// is an illegal-state error.
    pub fn cancel_job(&self, job_id: JobId) -> Result<(), JobServiceError> {
        let job = self.find(job_id)?;
        if matches!(job.state, JobState::CancelRequested | JobState::Canceled) {
            info!(job_id = %job_id, state = %job.state, "cancel ignored because of state");
            return Ok(());
        }
        if job.state != JobState::Running {
            return Err(JobServiceError::IllegalState(DomainError::illegal_state(format!(
                "job {job_id} is in state {}, cancel only possible when {}",
                job.state,
                JobState::Running
            ))));
        }

        if !self.execution.cancel(job_id) {
            // Not running on this replica; make the request visible anyway.
            update_job_record(&self.store, job_id, |job| {
                if job.state != JobState::Running {
                    return Ok(false);
                }
                job.mark_cancel_requested().map(|_| true)
            })?;
        }
        Ok(())
    }

    fn find(&self, job_id: JobId) -> Result<PdsJob, JobServiceError> {
        self.store
            .find_by_id(job_id)?
            .ok_or(JobServiceError::NotFound(job_id))
    }
}
