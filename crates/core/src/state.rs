//! Job state machine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a job.
///
/// ```text
/// CREATED -> READY_TO_START -> QUEUED -> RUNNING -> DONE | FAILED | CANCELED
///                   ^             |          |
///                   +- release ---+          +-> CANCEL_REQUESTED -> CANCELED
/// ```
///
/// `READY_TO_START` is the only state the claim protocol selects from.
///
/// A QUEUED job whose body never ran can also end directly: CANCELED when it
/// was cancelled while waiting for a worker, FAILED when it could not be
/// marked RUNNING. A replica that cannot run a QUEUED job releases it back to
/// READY_TO_START.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    ReadyToStart,
    Queued,
    Running,
    CancelRequested,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Created,
        JobState::ReadyToStart,
        JobState::Queued,
        JobState::Running,
        JobState::CancelRequested,
        JobState::Done,
        JobState::Failed,
        JobState::Canceled,
    ];

    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// Whether a record in `self` may be moved to `next`.
    ///
    /// Staying in the same state is always allowed (re-persisting is a no-op).
    /// A cancel-requested job may still end as DONE or FAILED: cancellation is
    /// cooperative and a body that never checks its token finishes normally.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        if self == next {
            return true;
        }
        match self {
            Created => matches!(next, ReadyToStart),
            ReadyToStart => matches!(next, Queued),
            Queued => matches!(next, ReadyToStart | Running | Failed | Canceled),
            Running => matches!(next, CancelRequested | Done | Failed | Canceled),
            CancelRequested => matches!(next, Canceled | Done | Failed),
            Done | Failed | Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::ReadyToStart => "READY_TO_START",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::CancelRequested => "CANCEL_REQUESTED",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}
