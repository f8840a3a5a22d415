//! Fail-fast window opened by a `Fallthrough` proposal.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Circuit breaker state shared by every invocation of one executor.
///
/// While open, calls are rejected with a clone of the error that opened it.
/// The breaker closes by itself once the window has passed.
pub(crate) struct FallthroughSupport<E> {
    state: Mutex<Option<OpenWindow<E>>>,
}

struct OpenWindow<E> {
    error: E,
    info: String,
    until: Instant,
}

impl<E: Clone> FallthroughSupport<E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// `Err` with the cached error while the window is open.
    pub(crate) fn check(&self, executor: &str) -> Result<(), E> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(open) = state.as_ref() {
            let now = Instant::now();
            if now < open.until {
                info!(
                    executor,
                    remaining_ms = (open.until - now).as_millis() as u64,
                    info = %open.info,
                    "fall through active, rethrowing cached error"
                );
                return Err(open.error.clone());
            }
            *state = None;
        }
        Ok(())
    }

    pub(crate) fn enable(&self, error: E, info: &str, duration: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(duration)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(OpenWindow {
            error,
            info: info.to_string(),
            until,
        });
    }

    pub(crate) fn is_active(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.as_ref().is_some_and(|open| Instant::now() < open.until)
    }
}
