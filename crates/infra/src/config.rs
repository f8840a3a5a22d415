//! Configuration loading and representation.
//!
//! Two sources:
//! - [`EngineConfig`]: process tuning from `PDS_*` environment variables.
//! - [`ServerConfiguration`]: the PDS server JSON file describing which
//!   products this server can run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_SERVER_CONFIG_FILE: &str = "PDS_SERVER_CONFIG_FILE";
pub const ENV_DATABASE_URL: &str = "PDS_DATABASE_URL";
pub const ENV_WORKER_THREAD_COUNT: &str = "PDS_WORKER_THREAD_COUNT";
pub const ENV_QUEUE_MAX: &str = "PDS_QUEUE_MAX";
pub const ENV_WATCHER_ENABLED: &str = "PDS_WATCHER_ENABLED";
pub const ENV_WATCHER_INITIAL_DELAY_MS: &str = "PDS_WATCHER_INITIAL_DELAY_MS";
pub const ENV_WATCHER_INTERVAL_MS: &str = "PDS_WATCHER_INTERVAL_MS";
pub const ENV_TRIGGER_INITIAL_DELAY_MS: &str = "PDS_TRIGGER_INITIAL_DELAY_MS";
pub const ENV_TRIGGER_INTERVAL_MS: &str = "PDS_TRIGGER_INTERVAL_MS";
pub const ENV_TRIGGER_ENABLED: &str = "PDS_TRIGGER_ENABLED";

pub const DEFAULT_SERVER_CONFIG_FILE: &str = "./pds-config.json";

/// Longest accepted product identifier.
pub const MAX_PRODUCT_ID_LENGTH: usize = 30;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value '{value}': {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("cannot read server configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse server configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("server configuration invalid: {0}")]
    Invalid(String),
}

/// Sizing and timing of the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub worker_thread_count: usize,
    /// Advisory admission threshold (see `ExecutionService::is_full`).
    pub queue_max: usize,
    pub watcher_enabled: bool,
    pub watcher_initial_delay: Duration,
    pub watcher_interval: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_thread_count: 5,
            queue_max: 50,
            watcher_enabled: true,
            watcher_initial_delay: Duration::from_millis(300),
            watcher_interval: Duration::from_millis(1000),
        }
    }
}

/// Timing of the periodic claim loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(3000),
            interval: Duration::from_millis(5000),
        }
    }
}

/// Process configuration read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub server_config_file: PathBuf,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub execution: ExecutionConfig,
    pub trigger: TriggerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_config_file: PathBuf::from(DEFAULT_SERVER_CONFIG_FILE),
            database_url: None,
            execution: ExecutionConfig::default(),
            trigger: TriggerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys use defaults;
    /// malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = EngineConfig::default();

        let worker_thread_count: usize = parse_or(&get, ENV_WORKER_THREAD_COUNT, defaults.execution.worker_thread_count)?;
        if worker_thread_count == 0 {
            return Err(ConfigError::InvalidEnv {
                key: ENV_WORKER_THREAD_COUNT,
                value: "0".to_string(),
                reason: "at least one worker thread is required".to_string(),
            });
        }

        Ok(Self {
            server_config_file: get(ENV_SERVER_CONFIG_FILE)
                .map(PathBuf::from)
                .unwrap_or(defaults.server_config_file),
            database_url: get(ENV_DATABASE_URL),
            execution: ExecutionConfig {
                worker_thread_count,
                queue_max: parse_or(&get, ENV_QUEUE_MAX, defaults.execution.queue_max)?,
                watcher_enabled: parse_or(&get, ENV_WATCHER_ENABLED, defaults.execution.watcher_enabled)?,
                watcher_initial_delay: millis_or(&get, ENV_WATCHER_INITIAL_DELAY_MS, defaults.execution.watcher_initial_delay)?,
                watcher_interval: millis_or(&get, ENV_WATCHER_INTERVAL_MS, defaults.execution.watcher_interval)?,
            },
            trigger: TriggerConfig {
                enabled: parse_or(&get, ENV_TRIGGER_ENABLED, defaults.trigger.enabled)?,
                initial_delay: millis_or(&get, ENV_TRIGGER_INITIAL_DELAY_MS, defaults.trigger.initial_delay)?,
                interval: millis_or(&get, ENV_TRIGGER_INTERVAL_MS, defaults.trigger.interval)?,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

/// Returns why `id` is not a usable product identifier, or `None` if it is.
pub fn product_identifier_error(id: &str) -> Option<String> {
    if id.is_empty() {
        return Some("product id may not be empty".to_string());
    }
    if id.len() > MAX_PRODUCT_ID_LENGTH {
        return Some(format!(
            "product id '{id}' is longer than {MAX_PRODUCT_ID_LENGTH} characters"
        ));
    }
    if let Some(c) = id.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Some(format!(
            "product id '{id}' contains '{c}', only [A-Za-z0-9_] is allowed"
        ));
    }
    None
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanType {
    CodeScan,
    InfraScan,
    WebScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub key: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSetup {
    #[serde(default)]
    pub mandatory: Vec<ParameterDefinition>,
    #[serde(default)]
    pub optional: Vec<ParameterDefinition>,
}

/// One executable product this server can launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSetup {
    pub id: String,
    /// Executable to launch.
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub scan_type: ScanType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSetup,
}

/// The PDS server JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    /// Cluster-wide id shared by every replica serving the same products.
    pub server_id: String,
    #[serde(default)]
    pub products: Vec<ProductSetup>,
}

impl ServerConfiguration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfiguration =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(reason) = product_identifier_error(&self.server_id) {
            return Err(ConfigError::Invalid(format!("server id: {reason}")));
        }

        let mut seen = HashSet::new();
        for product in &self.products {
            if let Some(reason) = product_identifier_error(&product.id) {
                return Err(ConfigError::Invalid(reason));
            }
            if !seen.insert(product.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "product id '{}' defined more than once",
                    product.id
                )));
            }
        }
        Ok(())
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductSetup> {
        self.products.iter().find(|p| p.id == product_id)
    }
}
