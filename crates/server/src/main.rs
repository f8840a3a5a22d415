//! PDS server process: loads configuration, opens the job store and runs the
//! execution engine until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use pds_infra::config::{EngineConfig, ServerConfiguration};
use pds_infra::execution::ExecutionBodyFactory;
use pds_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use pds_infra::launcher::ProductLauncher;
use pds_infra::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pds_observability::init();

    let config = EngineConfig::from_env().context("invalid environment configuration")?;
    let server = Arc::new(
        ServerConfiguration::load(&config.server_config_file).context("cannot load pds server configuration")?,
    );
    let launcher: Arc<dyn ExecutionBodyFactory> = Arc::new(ProductLauncher::new(server.clone()));

    match config.database_url.clone() {
        Some(database_url) => {
            let pool = PgPool::connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;
            let store = Arc::new(PostgresJobStore::new(pool)?);
            store.migrate().await?;
            run(store, server, config, launcher).await
        }
        None => {
            tracing::warn!("PDS_DATABASE_URL not set; jobs are kept in memory and lost on restart");
            run(InMemoryJobStore::arc(), server, config, launcher).await
        }
    }
}

async fn run<S>(
    store: S,
    server: Arc<ServerConfiguration>,
    config: EngineConfig,
    launcher: Arc<dyn ExecutionBodyFactory>,
) -> anyhow::Result<()>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    let engine = Engine::start(store, server, &config, launcher).context("failed to start pds engine")?;

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    // Shutdown joins worker threads and writes final states through the
    // store, which must not happen on a runtime thread.
    tokio::task::spawn_blocking(move || engine.shutdown())
        .await
        .context("engine shutdown panicked")?;
    Ok(())
}
