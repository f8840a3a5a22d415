use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use pds_core::{DomainError, JobId, JobState, JobStatus, PdsJob};

use crate::config::ExecutionConfig;
use crate::jobs::{JobStore, JobStoreError};

use super::handle::{ExecutionHandle, ExecutionOutcome};
use super::pool::{PoolClosed, WorkerPool};
use super::{update_job_record, ExecutionBody, ExecutionBodyFactory, ExecutionContext, ExecutionError};

/// Why a job could not be submitted.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),
}

pub(super) struct QueueEntry {
    pub(super) handle: ExecutionHandle,
    pub(super) queued_at: DateTime<Utc>,
    /// Submission order, for stable status listings.
    pub(super) sequence: u64,
}

pub(super) struct Tracked {
    pub(super) entries: HashMap<JobId, QueueEntry>,
    next_sequence: u64,
}

/// Execution queue of one replica.
///
/// The map of tracked jobs is the single source of truth for "is this job
/// active here". Submit, cancel and watcher reconciliation all run under its
/// lock, so none of them sees another half-done.
pub struct ExecutionService<S> {
    pub(super) store: S,
    factory: Arc<dyn ExecutionBodyFactory>,
    config: ExecutionConfig,
    pool: WorkerPool,
    pub(super) tracked: Mutex<Tracked>,
}

impl<S> ExecutionService<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(
        store: S,
        factory: Arc<dyn ExecutionBodyFactory>,
        config: ExecutionConfig,
    ) -> io::Result<Self> {
        let pool = WorkerPool::new("pds-worker", config.worker_thread_count)?;
        Ok(Self {
            store,
            factory,
            config,
            pool,
            tracked: Mutex::new(Tracked {
                entries: HashMap::new(),
                next_sequence: 0,
            }),
        })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Advisory admission check; callers ask this before claiming work.
    pub fn is_full(&self) -> bool {
        self.lock().entries.len() >= self.config.queue_max
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn handle(&self, job_id: JobId) -> Option<ExecutionHandle> {
        self.lock().entries.get(&job_id).map(|e| e.handle.clone())
    }

    /// Persist `job` as QUEUED and hand it to the worker pool.
    ///
    /// Capacity is not enforced here: an overloaded queue is logged and the
    /// job is still accepted. A job id that is already tracked replaces (and
    /// cancels) the former handle.
    pub fn submit(&self, job: PdsJob) -> Result<(), SubmitError> {
        let job_id = job.id;
        let former = {
            let mut tracked = self.lock();
            debug!(job_id = %job_id, "add job to execution queue");

            let size = tracked.entries.len();
            if size >= self.config.queue_max {
                warn!(size, queue_max = self.config.queue_max, "execution queue overload");
            }

            let mut job = job;
            job.mark_queued()?;
            let job = self.store.save(&job)?;

            let handle = ExecutionHandle::new(job_id);
            let body = self.factory.create_body(&job);
            let task = ExecutionTask {
                store: self.store.clone(),
                handle: handle.clone(),
                job_id,
                configuration: job.configuration.clone(),
                body,
            };
            self.pool.execute(move || task.run())?;

            let sequence = tracked.next_sequence;
            tracked.next_sequence += 1;
            tracked.entries.insert(
                job_id,
                QueueEntry {
                    handle,
                    queued_at: Utc::now(),
                    sequence,
                },
            )
        };

        if let Some(former) = former {
            error!(job_id = %job_id, "found former job in queue with same job id");
            former.handle.cancel();
            info!(job_id = %job_id, "cancelled former job");
        }
        Ok(())
    }

    /// Request cooperative cancellation of a tracked job.
    ///
    /// Returns `true` only when this call requested the cancellation; an
    /// untracked, finished or already-cancelled job gives `false`. When the
    /// record is RUNNING it is moved to CANCEL_REQUESTED; the watcher later
    /// records the final state.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let tracked = self.lock();

        let Some(entry) = tracked.entries.get(&job_id) else {
            return false;
        };
        if entry.handle.is_done() {
            info!(job_id = %job_id, "cancellation of job skipped, because already done");
            return false;
        }
        if !entry.handle.cancel() {
            debug!(job_id = %job_id, "cancellation already requested");
            return false;
        }
        info!(job_id = %job_id, "cancelled job");

        let persisted = update_job_record(&self.store, job_id, |job| {
            if job.state != JobState::Running {
                return Ok(false);
            }
            job.mark_cancel_requested().map(|_| true)
        });
        if let Err(e) = persisted {
            warn!(job_id = %job_id, error = %e, "could not persist cancel request");
        }
        true
    }

    /// Snapshot of everything tracked on this replica.
    pub fn execution_status(&self) -> ExecutionStatus {
        let tracked = self.lock();

        let mut ordered: Vec<(&JobId, &QueueEntry)> = tracked.entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.sequence);

        let entries = ordered
            .into_iter()
            .map(|(job_id, entry)| {
                let job = match self.store.find_by_id(*job_id) {
                    Ok(job) => job.as_ref().map(JobStatus::from),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "could not load job for execution status");
                        None
                    }
                };
                ExecutionEntry {
                    job_uuid: *job_id,
                    queued_at: entry.queued_at,
                    done: entry.handle.is_done(),
                    cancelled: entry.handle.is_cancelled() || entry.handle.is_cancel_requested(),
                    job,
                }
            })
            .collect();

        ExecutionStatus {
            queue_max: self.config.queue_max,
            jobs_in_queue: tracked.entries.len(),
            entries,
        }
    }

    /// Hand an untracked QUEUED job back to the claim protocol.
    ///
    /// Used when a claimed job cannot be run here. Returns `true` when this
    /// call moved the record to READY_TO_START.
    pub fn release(&self, job_id: JobId) -> bool {
        let tracked = self.lock();
        if tracked.entries.contains_key(&job_id) {
            debug!(job_id = %job_id, "job is tracked, not releasing it");
            return false;
        }
        self.release_record(job_id)
    }

    fn release_record(&self, job_id: JobId) -> bool {
        let mut moved = false;
        let released = update_job_record(&self.store, job_id, |job| {
            moved = job.state == JobState::Queued;
            if !moved {
                return Ok(false);
            }
            job.release().map(|_| true)
        });
        match released {
            Ok(Some(_)) if moved => {
                info!(job_id = %job_id, "released job back to READY_TO_START");
                true
            }
            Ok(Some(job)) => {
                debug!(job_id = %job_id, state = %job.state, "job not released, it is not QUEUED");
                false
            }
            Ok(None) => false,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "could not release job, it stays QUEUED");
                false
            }
        }
    }

    /// Stop the worker threads.
    ///
    /// Jobs whose task has not started are untracked and released back to
    /// READY_TO_START for another replica. Started jobs are cancelled and
    /// left for the watcher. Returns the number of released jobs.
    pub fn shutdown(&self) -> usize {
        let withdrawn: Vec<JobId> = {
            let mut tracked = self.lock();
            let mut withdrawn = Vec::new();
            for (job_id, entry) in &tracked.entries {
                if entry.handle.withdraw() {
                    withdrawn.push(*job_id);
                } else {
                    entry.handle.cancel();
                }
            }
            for job_id in &withdrawn {
                tracked.entries.remove(job_id);
            }
            withdrawn
        };
        self.pool.shutdown();

        withdrawn
            .into_iter()
            .filter(|job_id| self.release_record(*job_id))
            .count()
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Drop for ExecutionService<S> {
    fn drop(&mut self) {
        // Workers are joined when the pool drops; make sure none is left waiting.
        let tracked = self.tracked.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in tracked.entries.values() {
            entry.handle.cancel();
        }
    }
}

/// Admin view of the execution queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub queue_max: usize,
    pub jobs_in_queue: usize,
    pub entries: Vec<ExecutionEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEntry {
    pub job_uuid: JobId,
    pub queued_at: DateTime<Utc>,
    pub done: bool,
    pub cancelled: bool,
    /// Persisted record, if it still exists.
    pub job: Option<JobStatus>,
}

/// What a worker thread runs for one job.
struct ExecutionTask<S> {
    store: S,
    handle: ExecutionHandle,
    job_id: JobId,
    configuration: String,
    body: ExecutionBody,
}

impl<S: JobStore> ExecutionTask<S> {
    fn run(self) {
        let ExecutionTask {
            store,
            handle,
            job_id,
            configuration,
            body,
        } = self;

        let outcome = execute(&store, &handle, job_id, configuration, body);
        handle.complete(outcome);
    }
}

fn execute<S: JobStore>(
    store: &S,
    handle: &ExecutionHandle,
    job_id: JobId,
    configuration: String,
    body: ExecutionBody,
) -> ExecutionOutcome {
    if !handle.begin() {
        debug!(job_id = %job_id, "job withdrawn before it started");
        return ExecutionOutcome::Cancelled;
    }
    let token = handle.token();
    if token.is_cancelled() {
        debug!(job_id = %job_id, "job cancelled before it started");
        return ExecutionOutcome::Cancelled;
    }

    if let Err(e) = mark_running(store, job_id) {
        return ExecutionOutcome::Failed(e);
    }

    let ctx = ExecutionContext::new(job_id, configuration, token.clone());
    debug!(job_id = %job_id, "running job");

    match panic::catch_unwind(AssertUnwindSafe(move || body(&ctx))) {
        Ok(Ok(done)) => ExecutionOutcome::Completed(done),
        Ok(Err(ExecutionError::Cancelled)) => ExecutionOutcome::Cancelled,
        Ok(Err(_)) if token.is_cancelled() => ExecutionOutcome::Cancelled,
        Ok(Err(e)) => ExecutionOutcome::Failed(e),
        Err(payload) => ExecutionOutcome::Failed(ExecutionError::Panicked(panic_message(&*payload))),
    }
}

fn mark_running<S: JobStore>(store: &S, job_id: JobId) -> Result<(), ExecutionError> {
    match update_job_record(store, job_id, |job| job.mark_running().map(|_| true))? {
        Some(_) => Ok(()),
        None => Err(JobStoreError::NotFound(job_id).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
