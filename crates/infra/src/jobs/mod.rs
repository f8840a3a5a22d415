//! PDS job records and the operations around them.
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres) with optimistic versions
//! - `JobClaimer`: takes the oldest READY_TO_START job for this server
//! - `JobConfiguration`: the caller's job payload
//! - `JobService`: create, mark ready, status, result, cancel

pub mod claim;
pub mod configuration;
pub mod postgres;
pub mod service;
pub mod store;

pub use claim::JobClaimer;
pub use configuration::{JobConfiguration, JobParameter};
pub use postgres::{PostgresJobStore, MIGRATION};
pub use service::{JobCreateResult, JobService, JobServiceError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
