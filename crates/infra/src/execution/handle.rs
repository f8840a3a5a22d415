use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use pds_core::JobId;

use super::{ExecutionError, ExecutionResult};

/// How a job's task ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The body ran to completion; its own `failed` flag decides DONE/FAILED.
    Completed(ExecutionResult),
    /// Cancellation took effect before or during the body.
    Cancelled,
    /// The body (or the task wrapper) returned an error or panicked.
    Failed(ExecutionError),
}

/// Tracked state of one submitted job: its cancellation token and, once the
/// task has finished, its outcome.
///
/// Cheap to clone; all clones observe the same job.
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const WITHDRAWN: u8 = 2;

struct HandleInner {
    job_id: JobId,
    token: CancellationToken,
    phase: AtomicU8,
    outcome: Mutex<Option<ExecutionOutcome>>,
}

impl ExecutionHandle {
    pub fn new(job_id: JobId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                job_id,
                token: CancellationToken::new(),
                phase: AtomicU8::new(PENDING),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    /// Whether cancellation was requested (the task may still be running).
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether the task ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), Some(ExecutionOutcome::Cancelled))
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `true` only when this call was the one that requested it for a
    /// task that has not finished yet.
    pub fn cancel(&self) -> bool {
        let outcome = self.lock();
        if outcome.is_some() || self.inner.token.is_cancelled() {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    /// Called by the task before it touches the job. `false` means the
    /// handle was withdrawn and the task must not run.
    pub(crate) fn begin(&self) -> bool {
        self.inner
            .phase
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take back a job whose task has not started and was not cancelled.
    ///
    /// On success the task will never run, so the job can be handed to
    /// another replica.
    pub(crate) fn withdraw(&self) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        self.inner
            .phase
            .compare_exchange(PENDING, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record how the task ended. The first outcome wins.
    pub(crate) fn complete(&self, outcome: ExecutionOutcome) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    /// Look at the outcome without taking it out.
    pub fn with_outcome<R>(&self, f: impl FnOnce(Option<&ExecutionOutcome>) -> R) -> R {
        let outcome = self.lock();
        f(outcome.as_ref())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ExecutionOutcome>> {
        self.inner.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("job_id", &self.inner.job_id)
            .field("done", &self.is_done())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdraw_only_before_start_and_without_cancellation() {
        let pending = ExecutionHandle::new(JobId::new());
        assert!(pending.withdraw());
        assert!(!pending.begin());
        assert!(!pending.withdraw());

        let started = ExecutionHandle::new(JobId::new());
        assert!(started.begin());
        assert!(!started.withdraw());

        let cancelled = ExecutionHandle::new(JobId::new());
        assert!(cancelled.cancel());
        assert!(!cancelled.withdraw());
        assert!(cancelled.begin());
    }

    #[test]
    fn cancel_is_accepted_once_and_not_after_completion() {
        let handle = ExecutionHandle::new(JobId::new());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancel_requested());
        assert!(!handle.is_done());

        let finished = ExecutionHandle::new(JobId::new());
        finished.complete(ExecutionOutcome::Completed(ExecutionResult::success("ok")));
        assert!(finished.is_done());
        assert!(!finished.cancel());
        assert!(!finished.is_cancel_requested());
    }

    #[test]
    fn first_outcome_wins() {
        let handle = ExecutionHandle::new(JobId::new());
        handle.complete(ExecutionOutcome::Cancelled);
        handle.complete(ExecutionOutcome::Completed(ExecutionResult::success("late")));

        assert!(handle.is_cancelled());
        assert!(handle.with_outcome(|o| matches!(o, Some(ExecutionOutcome::Cancelled))));
    }
}
