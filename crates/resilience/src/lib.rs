//! `pds-resilience`: retry and fall-through around calls to external systems.
//!
//! Adapter integrations wrap every remote call in a [`ResilientActionExecutor`]
//! and register the [`ResilienceConsultant`]s that know the failure modes of
//! that particular remote. Consultants turn an error into a
//! [`ResilienceProposal`]; errors nobody recognises propagate unchanged.

mod consultant;
mod context;
mod executor;
mod fallthrough;
mod proposal;

pub use consultant::ResilienceConsultant;
pub use context::ResilienceContext;
pub use executor::ResilientActionExecutor;
pub use proposal::ResilienceProposal;
