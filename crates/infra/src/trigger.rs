//! Periodic claim loop feeding the execution queue.

use std::io;
use std::sync::Arc;

use tracing::{debug, error, warn};

use pds_core::JobId;

use crate::config::TriggerConfig;
use crate::execution::ExecutionService;
use crate::jobs::{JobClaimer, JobStore};
use crate::workers::{PeriodicWorker, WorkerHandle};

/// Claims at most one READY_TO_START job per tick and submits it, unless this
/// replica's execution queue is already full.
pub struct ExecutionTrigger<S> {
    claimer: JobClaimer<S>,
    execution: Arc<ExecutionService<S>>,
}

impl<S> ExecutionTrigger<S>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    pub fn new(claimer: JobClaimer<S>, execution: Arc<ExecutionService<S>>) -> Self {
        Self { claimer, execution }
    }

    /// One claim-and-submit round. Returns the submitted job, if any.
    ///
    /// A claimed job that cannot be submitted is released back to
    /// READY_TO_START so no replica leaves it stranded in QUEUED.
    pub fn trigger_once(&self) -> Option<JobId> {
        if self.execution.is_full() {
            debug!("execution queue full, not claiming");
            return None;
        }

        let job = match self.claimer.claim_next_runnable_job() {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "claiming next job failed");
                return None;
            }
        };

        let job_id = job.id;
        match self.execution.submit(job) {
            Ok(()) => Some(job_id),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "claimed job could not be submitted");
                self.execution.release(job_id);
                None
            }
        }
    }

    /// Run [`Self::trigger_once`] on the configured schedule.
    ///
    /// A disabled trigger still ticks, logging a warning each time.
    pub fn spawn(self, config: &TriggerConfig) -> io::Result<WorkerHandle> {
        let enabled = config.enabled;
        PeriodicWorker::spawn("pds-execution-trigger", config.initial_delay, config.interval, move || {
            if !enabled {
                warn!("execution trigger disabled");
                return;
            }
            self.trigger_once();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionResult;
    use crate::jobs::InMemoryJobStore;
    use crate::testing::{factory, gated_body, manual_config, ready_job, wait_until, FlakyStore};
    use pds_core::JobState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn claims_and_submits_one_job_per_round() {
        let store = InMemoryJobStore::arc();
        let execution = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), manual_config(1, 10)).unwrap(),
        );
        let trigger = ExecutionTrigger::new(JobClaimer::new(store.clone(), "server-a"), execution.clone());

        let first = ready_job(&*store, "alice", "{}");
        let second = ready_job(&*store, "alice", "{}");

        assert!(trigger.trigger_once().is_some());
        assert!(trigger.trigger_once().is_some());
        assert_eq!(trigger.trigger_once(), None);
        assert_eq!(execution.tracked_count(), 2);

        for id in [first.id, second.id] {
            let job = store.find_by_id(id).unwrap().unwrap();
            assert_eq!(job.server_id.as_deref(), Some("server-a"));
            assert_ne!(job.state, JobState::ReadyToStart);
        }
    }

    #[test]
    fn full_queue_claims_nothing() {
        let store = InMemoryJobStore::arc();
        let gate = Arc::new(AtomicBool::new(false));
        let execution = Arc::new(
            ExecutionService::new(store.clone(), factory(gated_body(gate.clone())), manual_config(1, 1)).unwrap(),
        );
        let trigger = ExecutionTrigger::new(JobClaimer::new(store.clone(), "server-a"), execution.clone());

        ready_job(&*store, "alice", "{}");
        let waiting = ready_job(&*store, "alice", "{}");

        assert!(trigger.trigger_once().is_some());
        assert!(execution.is_full());
        assert_eq!(trigger.trigger_once(), None);
        assert_eq!(store.find_by_id(waiting.id).unwrap().unwrap().state, JobState::ReadyToStart);

        gate.store(true, Ordering::SeqCst);
    }

    #[test]
    fn job_that_cannot_be_queued_is_released_and_claimed_again() {
        let store = Arc::new(FlakyStore::default());
        let execution = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), manual_config(1, 10)).unwrap(),
        );
        let trigger = ExecutionTrigger::new(JobClaimer::new(store.clone(), "server-a"), execution.clone());
        let job = ready_job(&*store, "alice", "{}");

        store.fail_queued_writes.store(true, Ordering::SeqCst);
        assert_eq!(trigger.trigger_once(), None);
        assert_eq!(execution.tracked_count(), 0);
        assert_eq!(store.find_by_id(job.id).unwrap().unwrap().state, JobState::ReadyToStart);

        store.fail_queued_writes.store(false, Ordering::SeqCst);
        assert_eq!(trigger.trigger_once(), Some(job.id));
        let handle = execution.handle(job.id).unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.is_done()));
        assert_eq!(execution.reconcile().finalized, 1);
        assert_eq!(store.find_by_id(job.id).unwrap().unwrap().state, JobState::Done);
    }

    #[test]
    fn job_claimed_after_shutdown_is_released() {
        let store = InMemoryJobStore::arc();
        let execution = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), manual_config(1, 10)).unwrap(),
        );
        let trigger = ExecutionTrigger::new(JobClaimer::new(store.clone(), "server-a"), execution.clone());
        execution.shutdown();

        let job = ready_job(&*store, "alice", "{}");
        assert_eq!(trigger.trigger_once(), None);
        assert_eq!(store.find_by_id(job.id).unwrap().unwrap().state, JobState::ReadyToStart);
    }

    #[test]
    fn spawned_trigger_picks_up_ready_jobs() {
        let store = InMemoryJobStore::arc();
        let execution = Arc::new(
            ExecutionService::new(store.clone(), factory(|_| Ok(ExecutionResult::success("ok"))), manual_config(1, 10)).unwrap(),
        );
        let trigger = ExecutionTrigger::new(JobClaimer::new(store.clone(), "server-a"), execution.clone());
        let handle = trigger
            .spawn(&TriggerConfig {
                enabled: true,
                initial_delay: Duration::from_millis(5),
                interval: Duration::from_millis(5),
            })
            .unwrap();

        let job = ready_job(&*store, "alice", "{}");
        assert!(wait_until(Duration::from_secs(5), || execution.handle(job.id).is_some()));
        handle.shutdown();
    }
}
