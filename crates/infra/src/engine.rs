//! One PDS replica: execution queue, watcher, claim trigger and the services
//! on top of them, sharing one job store.

use std::io;
use std::sync::Arc;

use tracing::info;

use crate::config::{EngineConfig, ServerConfiguration};
use crate::execution::{ExecutionBodyFactory, ExecutionService, ExecutionWatcher, ReconcileReport};
use crate::jobs::{JobClaimer, JobService, JobStore};
use crate::monitoring::MonitoringService;
use crate::trigger::ExecutionTrigger;
use crate::workers::WorkerHandle;

pub struct Engine<S> {
    server: Arc<ServerConfiguration>,
    execution: Arc<ExecutionService<S>>,
    jobs: JobService<S>,
    monitoring: MonitoringService<S>,
    watcher: Option<WorkerHandle>,
    trigger: Option<WorkerHandle>,
}

impl<S> Engine<S>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    /// Start worker pool, watcher and trigger.
    pub fn start(
        store: S,
        server: Arc<ServerConfiguration>,
        config: &EngineConfig,
        factory: Arc<dyn ExecutionBodyFactory>,
    ) -> io::Result<Self> {
        let execution = Arc::new(ExecutionService::new(store.clone(), factory, config.execution.clone())?);
        let jobs = JobService::new(store.clone(), server.clone(), execution.clone());
        let monitoring = MonitoringService::new(server.server_id.clone(), store.clone(), execution.clone());

        let watcher = ExecutionWatcher::spawn(execution.clone())?;
        let trigger = ExecutionTrigger::new(JobClaimer::new(store, server.server_id.clone()), execution.clone())
            .spawn(&config.trigger)?;

        info!(
            server_id = %server.server_id,
            products = server.products.len(),
            workers = config.execution.worker_thread_count,
            queue_max = config.execution.queue_max,
            "pds engine started"
        );

        Ok(Self {
            server,
            execution,
            jobs,
            monitoring,
            watcher: Some(watcher),
            trigger: Some(trigger),
        })
    }

    pub fn server(&self) -> &ServerConfiguration {
        &self.server
    }

    pub fn jobs(&self) -> &JobService<S> {
        &self.jobs
    }

    pub fn monitoring(&self) -> &MonitoringService<S> {
        &self.monitoring
    }

    pub fn execution(&self) -> &Arc<ExecutionService<S>> {
        &self.execution
    }

    /// Stop claiming, cancel what runs here, and record the final states.
    ///
    /// Jobs still waiting for a worker go back to READY_TO_START. Blocks
    /// until every worker thread has exited.
    pub fn shutdown(mut self) -> ReconcileReport {
        self.stop_workers();
        let released = self.execution.shutdown();
        let report = self.execution.reconcile();
        info!(
            server_id = %self.server.server_id,
            released,
            finalized = report.finalized,
            retained = report.retained,
            "pds engine stopped"
        );
        report
    }
}

impl<S> Engine<S> {
    // Trigger first so nothing new is claimed while the watcher winds down.
    fn stop_workers(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            trigger.shutdown();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
    }
}

impl<S> Drop for Engine<S> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
