//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use pds_core::{ExpectedVersion, JobId, JobState, PdsJob};

/// Job record store abstraction.
///
/// Every update goes through [`JobStore::save`], which is version-checked: a
/// writer holding a stale copy gets [`JobStoreError::Concurrency`] instead of
/// overwriting a newer record.
pub trait JobStore: Send + Sync {
    /// Insert a new job (version 0).
    fn create(&self, job: PdsJob) -> Result<PdsJob, JobStoreError>;

    /// Get a job by ID.
    fn find_by_id(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError>;

    /// Persist `job` if the stored version still equals `job.version`.
    ///
    /// Returns the stored record, whose version has been incremented.
    fn save(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError>;

    /// Atomically claim the oldest READY_TO_START job for `server_id`.
    ///
    /// The claimed record is moved to QUEUED, stamped with `server_id` and its
    /// version is force-incremented in the same step, so a concurrent caller
    /// (same process or another replica) can never receive it too.
    /// Returns `None` when nothing is ready.
    fn claim_oldest_ready_to_start(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError>;

    /// Number of jobs claimed by `server_id` currently in `state`.
    fn count_by_server_and_state(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError>;

    /// Delete a job. Returns whether a record existed.
    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
///
/// One `RwLock` guards all records, which makes claim and save trivially
/// atomic within the process.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, PdsJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: PdsJob) -> Result<PdsJob, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let mut stored = job;
        stored.version = 0;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    fn save(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let current = jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;

        ExpectedVersion::Exact(job.version)
            .check(current.version)
            .map_err(|e| JobStoreError::Concurrency(format!("job {}: {e}", job.id)))?;

        let mut stored = job.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    fn claim_oldest_ready_to_start(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

        // Oldest first; id breaks ties so the order is total.
        let oldest = jobs
            .values()
            .filter(|j| j.state == JobState::ReadyToStart)
            .min_by_key(|j| (j.created, j.id))
            .map(|j| j.id);

        let Some(job_id) = oldest else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.mark_queued()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        job.server_id = Some(server_id.to_string());
        job.version += 1;
        Ok(Some(job.clone()))
    }

    fn count_by_server_and_state(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let count = jobs
            .values()
            .filter(|j| j.state == state && j.server_id.as_deref() == Some(server_id))
            .count();
        Ok(count as u64)
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.remove(&job_id).is_some())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: PdsJob) -> Result<PdsJob, JobStoreError> {
        (**self).create(job)
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError> {
        (**self).find_by_id(job_id)
    }

    fn save(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError> {
        (**self).save(job)
    }

    fn claim_oldest_ready_to_start(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError> {
        (**self).claim_oldest_ready_to_start(server_id)
    }

    fn count_by_server_and_state(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError> {
        (**self).count_by_server_and_state(server_id, state)
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(job_id)
    }
}
