//! `pds-core`: job model building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job record, its state machine and the optimistic version contract.

pub mod error;
pub mod id;
pub mod job;
pub mod state;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{JobStatus, PdsJob};
pub use state::JobState;
pub use version::ExpectedVersion;
