//! Shared helpers for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pds_core::{JobId, JobState, PdsJob};

use crate::config::ExecutionConfig;
use crate::execution::{ExecutionBody, ExecutionBodyFactory, ExecutionContext, ExecutionError, ExecutionResult};
use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError};

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Create a job that is ready to be claimed.
pub fn ready_job<S: JobStore + ?Sized>(store: &S, owner: &str, configuration: &str) -> PdsJob {
    let mut job = PdsJob::new(JobId::new(), owner, configuration);
    job.mark_ready_to_start().unwrap();
    store.create(job).unwrap()
}

/// Execution config with the watcher left to the test.
pub fn manual_config(workers: usize, queue_max: usize) -> ExecutionConfig {
    ExecutionConfig {
        worker_thread_count: workers,
        queue_max,
        watcher_enabled: true,
        watcher_initial_delay: Duration::from_secs(3600),
        watcher_interval: Duration::from_secs(3600),
    }
}

/// Factory whose bodies all run `f`.
pub fn factory<F>(f: F) -> Arc<dyn ExecutionBodyFactory>
where
    F: Fn(&ExecutionContext) -> Result<ExecutionResult, ExecutionError> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |_job: &PdsJob| -> ExecutionBody {
        let f = f.clone();
        Box::new(move |ctx: &ExecutionContext| f(ctx))
    })
}

/// Body that waits until `gate` opens or cancellation is requested.
pub fn gated_body(gate: Arc<AtomicBool>) -> impl Fn(&ExecutionContext) -> Result<ExecutionResult, ExecutionError> + Send + Sync + 'static {
    move |ctx| {
        while !gate.load(Ordering::SeqCst) {
            ctx.check_cancelled()?;
            thread::sleep(Duration::from_millis(2));
        }
        Ok(ExecutionResult::success("finished"))
    }
}

/// Store whose writes fail while the matching flag is set.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryJobStore,
    pub fail_terminal_writes: AtomicBool,
    pub fail_queued_writes: AtomicBool,
}

impl JobStore for FlakyStore {
    fn create(&self, job: PdsJob) -> Result<PdsJob, JobStoreError> {
        self.inner.create(job)
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<PdsJob>, JobStoreError> {
        self.inner.find_by_id(job_id)
    }

    fn save(&self, job: &PdsJob) -> Result<PdsJob, JobStoreError> {
        if job.state.is_terminal() && self.fail_terminal_writes.load(Ordering::SeqCst) {
            return Err(JobStoreError::Storage("connection reset".to_string()));
        }
        if job.state == JobState::Queued && self.fail_queued_writes.load(Ordering::SeqCst) {
            return Err(JobStoreError::Storage("connection reset".to_string()));
        }
        self.inner.save(job)
    }

    fn claim_oldest_ready_to_start(&self, server_id: &str) -> Result<Option<PdsJob>, JobStoreError> {
        self.inner.claim_oldest_ready_to_start(server_id)
    }

    fn count_by_server_and_state(&self, server_id: &str, state: JobState) -> Result<u64, JobStoreError> {
        self.inner.count_by_server_and_state(server_id, state)
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.inner.delete(job_id)
    }
}
