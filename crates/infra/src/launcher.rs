//! Launching the configured product executable for a job.
//!
//! The product gets the job's parameters as environment variables:
//! `PDS_JOB_UUID`, `SECHUB_JOB_UUID` and one variable per parameter, the key
//! upper-cased with `.` replaced by `_` (`product1.level` -> `PRODUCT1_LEVEL`).
//! Whatever the product writes to stdout is the job result; a non-zero exit
//! marks the result as failed.

use std::collections::HashMap;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use pds_core::{JobId, PdsJob};
use pds_resilience::{ResilienceContext, ResilienceProposal, ResilientActionExecutor};

use crate::config::{ProductSetup, ServerConfiguration};
use crate::execution::{ExecutionBody, ExecutionBodyFactory, ExecutionContext, ExecutionError, ExecutionResult};
use crate::jobs::JobConfiguration;

pub const ENV_PDS_JOB_UUID: &str = "PDS_JOB_UUID";
pub const ENV_SECHUB_JOB_UUID: &str = "SECHUB_JOB_UUID";

const SPAWN_RETRIES: u32 = 3;
const SPAWN_RETRY_WAIT_MILLIS: u64 = 500;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long output is still read once the product has exited or was killed.
/// A process the product left behind may keep the pipes open.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("product '{0}' is not configured on this server")]
    UnknownProduct(String),
    #[error("job configuration unreadable: {0}")]
    Configuration(String),
    #[error("cannot start product {product}: {message}")]
    Spawn {
        product: String,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("lost track of product {product}: {message}")]
    Process { product: String, message: String },
}

impl LaunchError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LaunchError::Spawn { kind, .. } if matches!(
                kind,
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ResourceBusy
                    | io::ErrorKind::ExecutableFileBusy
            )
        )
    }
}

impl From<LaunchError> for ExecutionError {
    fn from(e: LaunchError) -> Self {
        ExecutionError::Other(anyhow::Error::new(e))
    }
}

fn transient_spawn_consultant(context: &mut ResilienceContext<LaunchError>) -> Option<ResilienceProposal> {
    let error = context.current_error()?;
    error
        .is_transient()
        .then(|| ResilienceProposal::retry("product start failed temporarily", SPAWN_RETRIES, SPAWN_RETRY_WAIT_MILLIS))
}

/// Environment variable name for a job parameter key.
pub fn parameter_env_name(key: &str) -> String {
    key.to_uppercase().replace('.', "_")
}

/// Default [`ExecutionBodyFactory`]: runs the product named in the job's
/// configuration as a child process.
pub struct ProductLauncher {
    server: Arc<ServerConfiguration>,
    // One executor per product: a product that cannot be started must not
    // throttle the others.
    executors: HashMap<String, Arc<ResilientActionExecutor<LaunchError>>>,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl ProductLauncher {
    pub fn new(server: Arc<ServerConfiguration>) -> Self {
        let executors = server
            .products
            .iter()
            .map(|product| {
                let executor = ResilientActionExecutor::new(format!("product-{}", product.id))
                    .with_consultant(transient_spawn_consultant);
                (product.id.clone(), Arc::new(executor))
            })
            .collect();
        Self {
            server,
            executors,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// How often a running product is checked for exit and cancellation.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long to keep reading output after the product is gone.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    fn prepare(&self, job: &PdsJob) -> Result<Launch, LaunchError> {
        let configuration = JobConfiguration::from_json(&job.configuration)
            .map_err(|e| LaunchError::Configuration(e.to_string()))?;
        let product = self
            .server
            .product(&configuration.product_id)
            .ok_or_else(|| LaunchError::UnknownProduct(configuration.product_id.clone()))?;
        let executor = self
            .executors
            .get(&product.id)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownProduct(product.id.clone()))?;

        Ok(Launch {
            job_id: job.id,
            product: product.clone(),
            env: launch_env(job.id, &configuration),
            executor,
            poll_interval: self.poll_interval,
            drain_timeout: self.drain_timeout,
        })
    }
}

impl ExecutionBodyFactory for ProductLauncher {
    fn create_body(&self, job: &PdsJob) -> ExecutionBody {
        let prepared = self.prepare(job);
        Box::new(move |ctx: &ExecutionContext| prepared?.run(ctx))
    }
}

fn launch_env(job_id: JobId, configuration: &JobConfiguration) -> Vec<(String, String)> {
    let mut env = vec![(ENV_PDS_JOB_UUID.to_string(), job_id.to_string())];
    if let Some(sechub_job_uuid) = configuration.sechub_job_uuid {
        env.push((ENV_SECHUB_JOB_UUID.to_string(), sechub_job_uuid.to_string()));
    }
    env.extend(
        configuration
            .parameters
            .iter()
            .map(|p| (parameter_env_name(&p.key), p.value.clone())),
    );
    env
}

/// Everything needed to run one product process.
struct Launch {
    job_id: JobId,
    product: ProductSetup,
    env: Vec<(String, String)>,
    executor: Arc<ResilientActionExecutor<LaunchError>>,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl Launch {
    fn run(self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        ctx.check_cancelled()?;

        let mut child = self.executor.execute_resilient(|| self.spawn())?;
        info!(job_id = %self.job_id, product = %self.product.id, pid = child.id(), "product started");

        let stdout = child.stdout.take().map(PipeDrain::spawn);
        let stderr = child.stderr.take().map(PipeDrain::spawn);

        let waited = self.wait(&mut child, ctx);

        let output = self.collect(stdout, "stdout");
        let errors = self.collect(stderr, "stderr");
        let status = waited?;
        if status.success() {
            debug!(job_id = %self.job_id, product = %self.product.id, "product finished");
            Ok(ExecutionResult::success(output))
        } else {
            warn!(
                job_id = %self.job_id,
                product = %self.product.id,
                exit_code = ?status.code(),
                stderr = %errors.trim(),
                "product finished with failure"
            );
            Ok(ExecutionResult::failure(output))
        }
    }

    fn spawn(&self) -> Result<Child, LaunchError> {
        Command::new(&self.product.path)
            .args(&self.product.arguments)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                product: self.product.id.clone(),
                kind: e.kind(),
                message: format!("{}: {e}", self.product.path.display()),
            })
    }

    fn wait(&self, child: &mut Child, ctx: &ExecutionContext) -> Result<ExitStatus, ExecutionError> {
        loop {
            if ctx.is_cancelled() {
                info!(job_id = %self.job_id, product = %self.product.id, "cancel requested, killing product");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutionError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    let _ = child.kill();
                    return Err(LaunchError::Process {
                        product: self.product.id.clone(),
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }
    }
}

// Pipes are read on their own threads so a chatty product never blocks on a
// full pipe while we poll for its exit.
struct PipeDrain {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: mpsc::Receiver<()>,
}

impl PipeDrain {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, closed) = mpsc::channel();
        let sink = buf.clone();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });
        Self { buf, closed }
    }

    /// Output read so far, waiting at most `timeout` for the pipe to close.
    fn finish(self, timeout: Duration) -> (String, bool) {
        let closed = !matches!(self.closed.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        (String::from_utf8_lossy(&buf).into_owned(), closed)
    }
}

impl Launch {
    fn collect(&self, pipe: Option<PipeDrain>, name: &str) -> String {
        let Some(pipe) = pipe else {
            return String::new();
        };
        let (output, closed) = pipe.finish(self.drain_timeout);
        if !closed {
            warn!(
                job_id = %self.job_id,
                product = %self.product.id,
                pipe = name,
                "pipe still open after product ended, using output read so far"
            );
        }
        output
    }
}
