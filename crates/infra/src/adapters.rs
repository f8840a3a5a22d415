//! Failure handling for calls to remote scan products.
//!
//! Adapter integrations report failures as [`AdapterError`] and run their
//! remote calls through [`adapter_executor`], which knows the HTTP failure
//! modes worth retrying or short-circuiting.

use pds_resilience::{ResilienceConsultant, ResilienceContext, ResilienceProposal, ResilientActionExecutor};

pub const BAD_REQUEST_RETRIES: u32 = 3;
pub const BAD_REQUEST_WAIT_MILLIS: u64 = 2_000;
pub const SERVER_ERROR_RETRIES: u32 = 3;
pub const SERVER_ERROR_WAIT_MILLIS: u64 = 5_000;
pub const SERVICE_UNAVAILABLE_FALLTHROUGH_MILLIS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{target} answered HTTP {status}: {message}")]
    Http {
        target: String,
        status: u16,
        message: String,
    },
    #[error("{target} not reachable: {message}")]
    Transport { target: String, message: String },
    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn http(target: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        AdapterError::Http {
            target: target.into(),
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn current_status(context: &ResilienceContext<AdapterError>) -> Option<u16> {
    context.current_error().and_then(AdapterError::status)
}

/// Some products answer 400 while still digesting a previous request.
#[derive(Debug, Default, Clone, Copy)]
pub struct BadRequestConsultant;

impl ResilienceConsultant<AdapterError> for BadRequestConsultant {
    fn consult(&self, context: &mut ResilienceContext<AdapterError>) -> Option<ResilienceProposal> {
        (current_status(context)? == 400).then(|| {
            ResilienceProposal::retry("bad request handling", BAD_REQUEST_RETRIES, BAD_REQUEST_WAIT_MILLIS)
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ServerErrorConsultant;

impl ResilienceConsultant<AdapterError> for ServerErrorConsultant {
    fn consult(&self, context: &mut ResilienceContext<AdapterError>) -> Option<ResilienceProposal> {
        (current_status(context)? == 500).then(|| {
            ResilienceProposal::retry("internal server error handling", SERVER_ERROR_RETRIES, SERVER_ERROR_WAIT_MILLIS)
        })
    }
}

/// 503 means the product is down; stop hammering it for a while.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceUnavailableConsultant;

impl ResilienceConsultant<AdapterError> for ServiceUnavailableConsultant {
    fn consult(&self, context: &mut ResilienceContext<AdapterError>) -> Option<ResilienceProposal> {
        (current_status(context)? == 503).then(|| {
            ResilienceProposal::fallthrough("service unavailable handling", SERVICE_UNAVAILABLE_FALLTHROUGH_MILLIS)
        })
    }
}

/// Executor for one remote target with all adapter consultants registered.
pub fn adapter_executor(target: impl Into<String>) -> ResilientActionExecutor<AdapterError> {
    ResilientActionExecutor::new(target)
        .with_consultant(BadRequestConsultant)
        .with_consultant(ServerErrorConsultant)
        .with_consultant(ServiceUnavailableConsultant)
}
