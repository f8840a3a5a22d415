//! Process-wide tracing setup shared by PDS binaries.

/// Initialize tracing/logging with the format from `PDS_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat};
