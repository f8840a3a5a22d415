//! PDS runtime: job records, claiming, execution and the services around them.
//!
//! ## Layout
//!
//! - [`jobs`]: job store (in-memory, Postgres), claim protocol, job service
//! - [`execution`]: worker pool, execution handles, watcher
//! - [`trigger`]: periodic claim-and-submit loop
//! - [`engine`]: wires one replica together
//! - [`launcher`]: runs product executables as job bodies
//! - [`adapters`]: failure consultants for remote products
//! - [`monitoring`]: job counts and queue status
//! - [`config`]: environment and server configuration file

pub mod adapters;
pub mod config;
pub mod engine;
pub mod execution;
pub mod jobs;
pub mod launcher;
pub mod monitoring;
pub mod trigger;
pub mod workers;

#[cfg(test)]
mod testing;

pub use engine::Engine;
