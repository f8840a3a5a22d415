use std::io;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use pds_core::{JobId, JobState};

use crate::jobs::JobStore;
use crate::workers::{PeriodicWorker, WorkerHandle};

use super::handle::{ExecutionHandle, ExecutionOutcome};
use super::service::ExecutionService;

/// Result stored on a job whose body returned an error or panicked.
///
/// The underlying error is only logged.
pub const GENERIC_FAILURE_RESULT: &str = "Job execution failed";

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Terminal state persisted and handle dropped.
    pub finalized: usize,
    /// Record was gone; handle dropped.
    pub orphaned: usize,
    /// Record refused the terminal state (already terminal); handle dropped.
    pub rejected: usize,
    /// Store could not be read or written; handle kept for the next pass.
    pub retained: usize,
}

impl<S> ExecutionService<S>
where
    S: JobStore + Clone + 'static,
{
    /// Persist the terminal state of every finished job and stop tracking it.
    ///
    /// One bad record never stops the others from being reconciled.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut tracked = self.lock();

        let done: Vec<JobId> = tracked
            .entries
            .iter()
            .filter(|(_, entry)| entry.handle.is_done())
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in done {
            let Some(handle) = tracked.entries.get(&job_id).map(|e| e.handle.clone()) else {
                continue;
            };
            match self.finalize(&handle) {
                Finalize::Persisted => report.finalized += 1,
                Finalize::Orphaned => report.orphaned += 1,
                Finalize::Rejected => report.rejected += 1,
                Finalize::Retry => {
                    report.retained += 1;
                    continue;
                }
            }
            tracked.entries.remove(&job_id);
        }

        if report != ReconcileReport::default() {
            debug!(?report, "reconciled finished jobs");
        }
        report
    }

    fn finalize(&self, handle: &ExecutionHandle) -> Finalize {
        let job_id = handle.job_id();
        let mut job = match self.store.find_by_id(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %job_id, "job does no longer exist, but result available, so remove from queue");
                return Finalize::Orphaned;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "was not able to load job, will retry");
                return Finalize::Retry;
            }
        };

        let (state, result) = handle.with_outcome(|outcome| terminal_state(job_id, outcome));

        if let Err(e) = job.finish(state, result) {
            error!(job_id = %job_id, error = %e, "job refused its terminal state, remove from queue");
            return Finalize::Rejected;
        }

        match self.store.save(&job) {
            Ok(_) => Finalize::Persisted,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "was not able to persist terminal state, will retry");
                Finalize::Retry
            }
        }
    }
}

enum Finalize {
    Persisted,
    Orphaned,
    Rejected,
    Retry,
}

fn terminal_state(job_id: JobId, outcome: Option<&ExecutionOutcome>) -> (JobState, Option<String>) {
    match outcome {
        Some(ExecutionOutcome::Cancelled) => (JobState::Canceled, None),
        Some(ExecutionOutcome::Completed(done)) => {
            let state = if done.failed { JobState::Failed } else { JobState::Done };
            (state, Some(done.result.clone()))
        }
        Some(ExecutionOutcome::Failed(e)) => {
            error!(job_id = %job_id, error = %e, error_debug = ?e, "job failed in execution");
            (JobState::Failed, Some(GENERIC_FAILURE_RESULT.to_string()))
        }
        None => {
            // only called for done handles
            (JobState::Failed, Some(GENERIC_FAILURE_RESULT.to_string()))
        }
    }
}

/// Runs [`ExecutionService::reconcile`] on a fixed schedule.
#[derive(Debug)]
pub struct ExecutionWatcher;

impl ExecutionWatcher {
    /// Spawn the watcher thread using the service's configured cadence.
    ///
    /// A disabled watcher still ticks, logging a warning each time.
    pub fn spawn<S>(service: Arc<ExecutionService<S>>) -> io::Result<WorkerHandle>
    where
        S: JobStore + Clone + Send + Sync + 'static,
    {
        let initial_delay = service.config().watcher_initial_delay;
        let interval = service.config().watcher_interval;
        let enabled = service.config().watcher_enabled;

        PeriodicWorker::spawn("pds-execution-watcher", initial_delay, interval, move || {
            if !enabled {
                warn!("execution watcher disabled");
                return;
            }
            service.reconcile();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionError, ExecutionResult};
    use crate::jobs::InMemoryJobStore;
    use crate::testing::{factory, gated_body, manual_config, ready_job, wait_until, FlakyStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn finished<S>(service: &ExecutionService<S>, job_id: JobId) -> bool
    where
        S: JobStore + Clone + 'static,
    {
        service.handle(job_id).is_some_and(|h| h.is_done())
    }

    #[test]
    fn completed_bodies_become_done_or_failed_with_their_result() {
        let store = InMemoryJobStore::arc();
        let service = ExecutionService::new(
            store.clone(),
            factory(|ctx| {
                if ctx.configuration() == "bad" {
                    Ok(ExecutionResult::failure("exit code 2"))
                } else {
                    Ok(ExecutionResult::success("report"))
                }
            }),
            manual_config(2, 10),
        )
        .unwrap();

        let good = ready_job(&*store, "alice", "good");
        let bad = ready_job(&*store, "alice", "bad");
        service.submit(good.clone()).unwrap();
        service.submit(bad.clone()).unwrap();
        assert!(wait_until(WAIT, || finished(&service, good.id) && finished(&service, bad.id)));

        let report = service.reconcile();
        assert_eq!(report.finalized, 2);
        assert_eq!(service.tracked_count(), 0);

        let good = store.find_by_id(good.id).unwrap().unwrap();
        assert_eq!(good.state, JobState::Done);
        assert_eq!(good.result.as_deref(), Some("report"));
        assert!(good.ended.is_some());

        let bad = store.find_by_id(bad.id).unwrap().unwrap();
        assert_eq!(bad.state, JobState::Failed);
        assert_eq!(bad.result.as_deref(), Some("exit code 2"));
    }

    #[test]
    fn body_errors_become_failed_with_generic_result() {
        let store = InMemoryJobStore::arc();
        let service = ExecutionService::new(
            store.clone(),
            factory(|_| Err(ExecutionError::Other(anyhow::anyhow!("password=hunter2 rejected")))),
            manual_config(1, 10),
        )
        .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || finished(&service, job.id)));
        service.reconcile();

        let job = store.find_by_id(job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.result.as_deref(), Some(GENERIC_FAILURE_RESULT));
    }

    #[test]
    fn cancelled_job_is_finalized_as_canceled() {
        let store = InMemoryJobStore::arc();
        let service = ExecutionService::new(
            store.clone(),
            factory(gated_body(Arc::new(AtomicBool::new(false)))),
            manual_config(1, 10),
        )
        .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || {
            store.find_by_id(job.id).unwrap().unwrap().state == JobState::Running
        }));
        assert!(service.cancel(job.id));
        assert!(wait_until(WAIT, || finished(&service, job.id)));

        assert_eq!(service.reconcile().finalized, 1);
        let job = store.find_by_id(job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert!(job.result.is_none());
    }

    #[test]
    fn body_ignoring_cancellation_keeps_its_natural_outcome() {
        let store = InMemoryJobStore::arc();
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let service = ExecutionService::new(
            store.clone(),
            factory(move |_| {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(ExecutionResult::success("finished anyway"))
            }),
            manual_config(1, 10),
        )
        .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || {
            store.find_by_id(job.id).unwrap().unwrap().state == JobState::Running
        }));
        assert!(service.cancel(job.id));
        release.store(true, Ordering::SeqCst);
        assert!(wait_until(WAIT, || finished(&service, job.id)));

        service.reconcile();
        let job = store.find_by_id(job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.result.as_deref(), Some("finished anyway"));
    }

    #[test]
    fn orphaned_handle_is_dropped_without_error() {
        let store = InMemoryJobStore::arc();
        let service = ExecutionService::new(
            store.clone(),
            factory(|_| Ok(ExecutionResult::success("report"))),
            manual_config(1, 10),
        )
        .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || finished(&service, job.id)));
        store.delete(job.id).unwrap();

        let report = service.reconcile();
        assert_eq!(report.orphaned, 1);
        assert_eq!(service.tracked_count(), 0);
        assert!(store.find_by_id(job.id).unwrap().is_none());
    }

    #[test]
    fn store_write_failure_keeps_the_handle_for_the_next_pass() {
        let store = Arc::new(FlakyStore::default());
        let service = ExecutionService::new(
            store.clone(),
            factory(|_| Ok(ExecutionResult::success("report"))),
            manual_config(1, 10),
        )
        .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || finished(&service, job.id)));

        store.fail_terminal_writes.store(true, Ordering::SeqCst);
        let report = service.reconcile();
        assert_eq!(report.retained, 1);
        assert_eq!(service.tracked_count(), 1);
        assert_eq!(store.find_by_id(job.id).unwrap().unwrap().state, JobState::Running);

        store.fail_terminal_writes.store(false, Ordering::SeqCst);
        assert_eq!(service.reconcile().finalized, 1);
        assert_eq!(service.tracked_count(), 0);
        assert_eq!(store.find_by_id(job.id).unwrap().unwrap().state, JobState::Done);
    }

    #[test]
    fn unfinished_jobs_are_left_alone() {
        let store = InMemoryJobStore::arc();
        let gate = Arc::new(AtomicBool::new(false));
        let service = ExecutionService::new(store.clone(), factory(gated_body(gate.clone())), manual_config(1, 10)).unwrap();

        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();

        assert_eq!(service.reconcile(), ReconcileReport::default());
        assert_eq!(service.tracked_count(), 1);
        gate.store(true, Ordering::SeqCst);
    }

    #[test]
    fn spawned_watcher_finalizes_on_its_own() {
        let store = InMemoryJobStore::arc();
        let mut config = manual_config(1, 10);
        config.watcher_initial_delay = Duration::from_millis(10);
        config.watcher_interval = Duration::from_millis(10);
        let service = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), config).unwrap(),
        );

        let watcher = ExecutionWatcher::spawn(service.clone()).unwrap();
        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();

        assert!(wait_until(WAIT, || {
            store.find_by_id(job.id).unwrap().unwrap().state == JobState::Done
        }));
        assert_eq!(service.tracked_count(), 0);
        watcher.shutdown();
    }

    #[test]
    fn disabled_watcher_reconciles_nothing() {
        let store = InMemoryJobStore::arc();
        let mut config = manual_config(1, 10);
        config.watcher_enabled = false;
        config.watcher_initial_delay = Duration::from_millis(5);
        config.watcher_interval = Duration::from_millis(5);
        let service = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), config).unwrap(),
        );

        let watcher = ExecutionWatcher::spawn(service.clone()).unwrap();
        let job = ready_job(&*store, "alice", "{}");
        service.submit(job.clone()).unwrap();
        assert!(wait_until(WAIT, || finished(&service, job.id)));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(service.tracked_count(), 1);
        watcher.shutdown();
    }
}
