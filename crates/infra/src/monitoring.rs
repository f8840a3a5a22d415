//! Server status for operators: job counts per state plus this replica's queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use pds_core::JobState;

use crate::execution::{ExecutionService, ExecutionStatus};
use crate::jobs::{JobStore, JobStoreError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    /// Jobs of this server id, across all replicas.
    pub jobs: BTreeMap<JobState, u64>,
    /// This replica only.
    pub execution: ExecutionStatus,
}

impl MonitoringStatus {
    pub fn count(&self, state: JobState) -> u64 {
        self.jobs.get(&state).copied().unwrap_or_default()
    }
}

pub struct MonitoringService<S> {
    server_id: String,
    store: S,
    execution: Arc<ExecutionService<S>>,
}

impl<S> MonitoringService<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(server_id: impl Into<String>, store: S, execution: Arc<ExecutionService<S>>) -> Self {
        Self {
            server_id: server_id.into(),
            store,
            execution,
        }
    }

    pub fn status(&self) -> Result<MonitoringStatus, JobStoreError> {
        let mut jobs = BTreeMap::new();
        for state in JobState::ALL {
            let count = self.store.count_by_server_and_state(&self.server_id, state)?;
            jobs.insert(state, count);
        }
        debug!(server_id = %self.server_id, "collected monitoring status");

        Ok(MonitoringStatus {
            server_id: self.server_id.clone(),
            timestamp: Utc::now(),
            jobs,
            execution: self.execution.execution_status(),
        })
    }
}
