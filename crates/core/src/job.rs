//! The job record and its checked state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::state::JobState;

/// A scan work item as persisted by the job record store.
///
/// `configuration` and `result` are opaque serialized blobs; the engine passes
/// them through without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdsJob {
    pub id: JobId,
    /// Replica that claimed the job (unset until claimed).
    pub server_id: Option<String>,
    pub owner: String,
    pub state: JobState,
    pub configuration: String,
    /// Only ever set together with a terminal state.
    pub result: Option<String>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, incremented by the store on every update.
    pub version: u64,
}

impl PdsJob {
    pub fn new(id: JobId, owner: impl Into<String>, configuration: impl Into<String>) -> Self {
        Self {
            id,
            server_id: None,
            owner: owner.into(),
            state: JobState::Created,
            configuration: configuration.into(),
            result: None,
            created: Utc::now(),
            started: None,
            ended: None,
            version: 0,
        }
    }

    /// Owner signals that all inputs are staged.
    pub fn mark_ready_to_start(&mut self) -> DomainResult<()> {
        if self.state != JobState::Created {
            return Err(self.illegal(JobState::ReadyToStart));
        }
        self.transition_to(JobState::ReadyToStart)
    }

    pub fn mark_queued(&mut self) -> DomainResult<()> {
        self.transition_to(JobState::Queued)
    }

    /// Give a claimed job that never ran back to the claim protocol.
    pub fn release(&mut self) -> DomainResult<()> {
        if self.state != JobState::Queued {
            return Err(self.illegal(JobState::ReadyToStart));
        }
        self.transition_to(JobState::ReadyToStart)
    }

    pub fn mark_running(&mut self) -> DomainResult<()> {
        self.transition_to(JobState::Running)?;
        self.started.get_or_insert_with(Utc::now);
        Ok(())
    }

    pub fn mark_cancel_requested(&mut self) -> DomainResult<()> {
        if self.state != JobState::Running {
            return Err(self.illegal(JobState::CancelRequested));
        }
        self.transition_to(JobState::CancelRequested)
    }

    /// Move into a terminal state, setting `result` and `ended` together.
    pub fn finish(&mut self, state: JobState, result: Option<String>) -> DomainResult<()> {
        if !state.is_terminal() {
            return Err(DomainError::illegal_state(format!(
                "{state} is not a terminal state"
            )));
        }
        if self.state.is_terminal() {
            return Err(self.illegal(state));
        }
        self.transition_to(state)?;
        self.result = result;
        self.ended = Some(Utc::now());
        Ok(())
    }

    /// The result of a finished job.
    ///
    /// Only legal when DONE; any other state (including FAILED, which carries
    /// diagnostic text) is reported as an illegal-state error.
    pub fn result_if_done(&self) -> DomainResult<&str> {
        if self.state != JobState::Done {
            return Err(DomainError::illegal_state(format!(
                "job {} is in state {}, result only available when {}",
                self.id,
                self.state,
                JobState::Done
            )));
        }
        Ok(self.result.as_deref().unwrap_or_default())
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from(self)
    }

    fn transition_to(&mut self, next: JobState) -> DomainResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(self.illegal(next));
        }
        self.state = next;
        Ok(())
    }

    fn illegal(&self, next: JobState) -> DomainError {
        DomainError::illegal_state(format!(
            "job {} cannot move from {} to {}",
            self.id, self.state, next
        ))
    }
}

/// What a client polling a job gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_uuid: JobId,
    pub owner: String,
    pub state: JobState,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

impl From<&PdsJob> for JobStatus {
    fn from(job: &PdsJob) -> Self {
        Self {
            job_uuid: job.id,
            owner: job.owner.clone(),
            state: job.state,
            created: job.created,
            started: job.started,
            ended: job.ended,
        }
    }
}
