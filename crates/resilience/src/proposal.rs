//! What a consultant can propose after a failure.

use std::time::Duration;

/// Strategy proposed by a [`ResilienceConsultant`](crate::ResilienceConsultant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceProposal {
    /// Run the action again, at most `max_retries` times, waiting between attempts.
    Retry {
        info: String,
        max_retries: u32,
        wait_millis: u64,
    },
    /// Fail this call and fast-fail every following call for `duration_millis`.
    Fallthrough { info: String, duration_millis: u64 },
}

impl ResilienceProposal {
    pub fn retry(info: impl Into<String>, max_retries: u32, wait_millis: u64) -> Self {
        Self::Retry {
            info: info.into(),
            max_retries,
            wait_millis,
        }
    }

    pub fn fallthrough(info: impl Into<String>, duration_millis: u64) -> Self {
        Self::Fallthrough {
            info: info.into(),
            duration_millis,
        }
    }

    pub fn info(&self) -> &str {
        match self {
            Self::Retry { info, .. } | Self::Fallthrough { info, .. } => info,
        }
    }

    pub(crate) fn wait(&self) -> Duration {
        match self {
            Self::Retry { wait_millis, .. } => Duration::from_millis(*wait_millis),
            Self::Fallthrough { duration_millis, .. } => Duration::from_millis(*duration_millis),
        }
    }
}
