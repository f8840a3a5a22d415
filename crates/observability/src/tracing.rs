//! Tracing/logging initialization.

use core::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "PDS_LOG_FORMAT";

/// Output format of the fmt subscriber.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human readable, for local runs.
    Pretty,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log format '{0}', expected 'json' or 'pretty'")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(UnknownLogFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    /// Format from `PDS_LOG_FORMAT`; unset or unknown values fall back to JSON.
    pub fn from_env() -> Self {
        match std::env::var(ENV_LOG_FORMAT) {
            Ok(raw) => raw.parse().unwrap_or_else(|e: UnknownLogFormat| {
                eprintln!("{e}; using json");
                LogFormat::Json
            }),
            Err(_) => LogFormat::Json,
        }
    }
}

/// Initialize tracing/logging for the process, filtered by `RUST_LOG`
/// (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_twice_is_harmless() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
        ::tracing::info!("still logging");
    }
}
