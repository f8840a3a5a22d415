//! Domain error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures a client can be told about
/// (unknown job, wrong state, stale version, bad input). Transport and storage
/// concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job is unknown.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The operation is not allowed in the job's current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A conflict occurred (stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(id: JobId) -> Self {
        Self::NotFound(id)
    }
}
