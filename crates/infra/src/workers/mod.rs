//! Background worker threads.

pub mod periodic;

pub use periodic::{PeriodicWorker, WorkerHandle};
