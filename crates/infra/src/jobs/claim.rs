//! Claiming runnable jobs for this replica.

use tracing::{debug, warn};

use pds_core::PdsJob;

use super::store::{JobStore, JobStoreError};

/// Default number of selection attempts when a claim loses a version race.
pub const DEFAULT_CLAIM_ATTEMPTS: u32 = 3;

/// Picks the next READY_TO_START job and takes ownership of it.
///
/// Several replicas may share one store. The store's claim is atomic, so a
/// job can be handed to at most one of them; a loser sees
/// [`JobStoreError::Concurrency`] and simply selects again.
#[derive(Debug, Clone)]
pub struct JobClaimer<S> {
    store: S,
    server_id: String,
    max_attempts: u32,
}

impl<S: JobStore> JobClaimer<S> {
    pub fn new(store: S, server_id: impl Into<String>) -> Self {
        Self {
            store,
            server_id: server_id.into(),
            max_attempts: DEFAULT_CLAIM_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Claim the oldest READY_TO_START job, or `None` when nothing is ready.
    ///
    /// Losing every attempt to other replicas is reported as `None` too: the
    /// jobs went somewhere, just not here.
    pub fn claim_next_runnable_job(&self) -> Result<Option<PdsJob>, JobStoreError> {
        for attempt in 1..=self.max_attempts {
            match self.store.claim_oldest_ready_to_start(&self.server_id) {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, server_id = %self.server_id, "claimed job");
                    return Ok(Some(job));
                }
                Ok(None) => return Ok(None),
                Err(JobStoreError::Concurrency(msg)) => {
                    debug!(attempt, error = %msg, "claim lost a race, selecting again");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            server_id = %self.server_id,
            attempts = self.max_attempts,
            "could not claim a job, every attempt lost to another replica"
        );
        Ok(None)
    }
}
