//! Resilient action executor.

use std::fmt::Display;
use std::thread;

use tracing::{debug, info, warn};

use crate::consultant::ResilienceConsultant;
use crate::context::ResilienceContext;
use crate::fallthrough::FallthroughSupport;
use crate::proposal::ResilienceProposal;

/// Executes fallible actions with retry and fall-through behaviour decided by
/// registered consultants.
///
/// ## One executor per target
///
/// The fall-through window is shared by every call going through the same
/// executor. Use a dedicated executor for each external system: if server A
/// and server B share one, an outage of A fast-fails calls to B as well.
/// The type system cannot enforce this.
///
/// ## Blocking
///
/// Retries sleep on the calling thread. Job bodies run on dedicated worker
/// threads, so a retrying job keeps its worker for the whole wait.
pub struct ResilientActionExecutor<E> {
    name: String,
    consultants: Vec<Box<dyn ResilienceConsultant<E>>>,
    fallthrough: FallthroughSupport<E>,
}

impl<E> ResilientActionExecutor<E>
where
    E: Clone + Display + Send + 'static,
{
    /// Create an executor for the external target `name` (used in logs).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consultants: Vec::new(),
            fallthrough: FallthroughSupport::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a consultant. Consultants are asked in registration order.
    pub fn add<C>(&mut self, consultant: C)
    where
        C: ResilienceConsultant<E> + 'static,
    {
        self.consultants.push(Box::new(consultant));
    }

    pub fn with_consultant<C>(mut self, consultant: C) -> Self
    where
        C: ResilienceConsultant<E> + 'static,
    {
        self.add(consultant);
        self
    }

    pub fn consultant_count(&self) -> usize {
        self.consultants.len()
    }

    /// Whether calls are currently being fast-failed.
    pub fn is_fallthrough_active(&self) -> bool {
        self.fallthrough.is_active()
    }

    /// Run `action`, consulting on failure.
    ///
    /// - open fall-through window: the cached error is returned, `action` is not called
    /// - no proposal: the original error is returned unchanged
    /// - `Retry`: re-run after the wait until the retry budget is spent
    /// - `Fallthrough`: open the window and return the error
    pub fn execute_resilient<R, F>(&self, mut action: F) -> Result<R, E>
    where
        F: FnMut() -> Result<R, E>,
    {
        self.fallthrough.check(&self.name)?;

        let mut context = ResilienceContext::new();
        loop {
            let error = match action() {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            context.record_error(error.clone());
            let Some(proposal) = self.first_proposal(&mut context) else {
                debug!(executor = %self.name, error = %error, "no resilience proposal, rethrowing");
                return Err(error);
            };

            match &proposal {
                ResilienceProposal::Retry {
                    info, max_retries, ..
                } => {
                    let done = context.already_done_retries();
                    info!(
                        executor = %self.name,
                        retry = done,
                        max_retries = *max_retries,
                        info = %info,
                        "retry proposed"
                    );
                    if done >= *max_retries {
                        warn!(
                            executor = %self.name,
                            retries = done,
                            error = %error,
                            "maximum retry amount reached, rethrowing error"
                        );
                        return Err(error);
                    }
                    context.count_retry();
                    thread::sleep(proposal.wait());
                }
                ResilienceProposal::Fallthrough {
                    info,
                    duration_millis,
                } => {
                    info!(
                        executor = %self.name,
                        duration_ms = *duration_millis,
                        info = %info,
                        "fall through activated"
                    );
                    self.fallthrough.enable(error.clone(), info, proposal.wait());
                    return Err(error);
                }
            }
        }
    }

    fn first_proposal(&self, context: &mut ResilienceContext<E>) -> Option<ResilienceProposal> {
        self.consultants
            .iter()
            .find_map(|consultant| consultant.consult(context))
    }
}

impl<E> core::fmt::Debug for ResilientActionExecutor<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResilientActionExecutor")
            .field("name", &self.name)
            .field("consultants", &self.consultants.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    enum RemoteError {
        #[error("bad request")]
        BadRequest,
        #[error("remote exploded")]
        Boom,
    }

    fn always_retry(max_retries: u32, wait_millis: u64) -> impl ResilienceConsultant<RemoteError> {
        move |_: &mut ResilienceContext<RemoteError>| {
            Some(ResilienceProposal::retry("always", max_retries, wait_millis))
        }
    }

    fn fallthrough_on_boom(duration_millis: u64) -> impl ResilienceConsultant<RemoteError> {
        move |ctx: &mut ResilienceContext<RemoteError>| match ctx.current_error() {
            Some(RemoteError::Boom) => Some(ResilienceProposal::fallthrough("boom", duration_millis)),
            _ => None,
        }
    }

    #[test]
    fn success_does_not_consult() {
        let asked = Arc::new(AtomicUsize::new(0));
        let asked_clone = asked.clone();
        let executor = ResilientActionExecutor::new("target").with_consultant(
            move |_: &mut ResilienceContext<RemoteError>| {
                asked_clone.fetch_add(1, Ordering::SeqCst);
                None
            },
        );

        let result = executor.execute_resilient(|| Ok::<_, RemoteError>(7));

        assert_eq!(result, Ok(7));
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn without_proposal_the_original_error_is_returned() {
        let executor = ResilientActionExecutor::new("target").with_consultant(fallthrough_on_boom(1_000));
        let attempts = Cell::new(0);

        let result: Result<(), _> = executor.execute_resilient(|| {
            attempts.set(attempts.get() + 1);
            Err(RemoteError::BadRequest)
        });

        assert_eq!(result, Err(RemoteError::BadRequest));
        assert_eq!(attempts.get(), 1);
        assert!(!executor.is_fallthrough_active());
    }

    #[test]
    fn retry_budget_is_exhausted_then_error_is_returned() {
        let executor = ResilientActionExecutor::new("target").with_consultant(always_retry(3, 20));
        let attempts = Cell::new(0);
        let started = Instant::now();

        let result: Result<(), _> = executor.execute_resilient(|| {
            attempts.set(attempts.get() + 1);
            Err(RemoteError::Boom)
        });

        assert_eq!(result, Err(RemoteError::Boom));
        assert_eq!(attempts.get(), 4);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn three_retries_waiting_two_seconds_each() {
        let executor = ResilientActionExecutor::new("checkmarx").with_consultant(always_retry(3, 2000));
        let attempts = Cell::new(0);
        let started = Instant::now();

        let result: Result<(), _> = executor.execute_resilient(|| {
            attempts.set(attempts.get() + 1);
            Err(RemoteError::BadRequest)
        });

        assert_eq!(result, Err(RemoteError::BadRequest));
        assert_eq!(attempts.get(), 4);
        assert!(started.elapsed() >= Duration::from_millis(3 * 2000));
    }

    #[test]
    fn retry_recovers_when_action_starts_succeeding() {
        let executor = ResilientActionExecutor::new("target").with_consultant(always_retry(5, 1));
        let attempts = Cell::new(0);

        let result = executor.execute_resilient(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(RemoteError::Boom)
            } else {
                Ok("scan id 42")
            }
        });

        assert_eq!(result, Ok("scan id 42"));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn first_consultant_with_a_proposal_wins() {
        let second_asked = Arc::new(AtomicUsize::new(0));
        let second_clone = second_asked.clone();

        let executor = ResilientActionExecutor::new("target")
            .with_consultant(|ctx: &mut ResilienceContext<RemoteError>| match ctx.current_error() {
                Some(RemoteError::BadRequest) => Some(ResilienceProposal::retry("bad request", 1, 0)),
                _ => None,
            })
            .with_consultant(move |_: &mut ResilienceContext<RemoteError>| {
                second_clone.fetch_add(1, Ordering::SeqCst);
                Some(ResilienceProposal::fallthrough("second", 10_000))
            });

        let result: Result<(), _> = executor.execute_resilient(|| Err(RemoteError::BadRequest));

        assert_eq!(result, Err(RemoteError::BadRequest));
        assert_eq!(second_asked.load(Ordering::SeqCst), 0);
        assert!(!executor.is_fallthrough_active());
    }

    #[test]
    fn fallthrough_fast_fails_until_window_expires() {
        let executor = ResilientActionExecutor::new("nessus").with_consultant(fallthrough_on_boom(200));
        let attempts = Cell::new(0);
        let action = || {
            attempts.set(attempts.get() + 1);
            Err::<(), _>(RemoteError::Boom)
        };

        assert_eq!(executor.execute_resilient(action), Err(RemoteError::Boom));
        assert_eq!(attempts.get(), 1);
        assert!(executor.is_fallthrough_active());

        // inside the window: cached error, action untouched
        assert_eq!(executor.execute_resilient(action), Err(RemoteError::Boom));
        assert_eq!(attempts.get(), 1);

        thread::sleep(Duration::from_millis(250));
        assert!(!executor.is_fallthrough_active());

        let result = executor.execute_resilient(|| {
            attempts.set(attempts.get() + 1);
            Ok::<_, RemoteError>("back")
        });
        assert_eq!(result, Ok("back"));
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn fallthrough_window_is_per_executor() {
        let server_a = ResilientActionExecutor::new("a").with_consultant(fallthrough_on_boom(10_000));
        let server_b = ResilientActionExecutor::new("b").with_consultant(fallthrough_on_boom(10_000));

        let _ = server_a.execute_resilient(|| Err::<(), _>(RemoteError::Boom));

        assert!(server_a.is_fallthrough_active());
        assert_eq!(server_b.execute_resilient(|| Ok::<_, RemoteError>(1)), Ok(1));
    }

    #[test]
    fn consultants_see_error_retry_count_and_remembered_values() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let executor = ResilientActionExecutor::new("target").with_consultant(
            move |ctx: &mut ResilienceContext<RemoteError>| {
                let consulted = ctx.value::<u32>("consulted").copied().unwrap_or(0) + 1;
                ctx.set_value("consulted", consulted);
                seen_clone.lock().unwrap().push((
                    ctx.current_error().cloned(),
                    ctx.already_done_retries(),
                    consulted,
                ));
                Some(ResilienceProposal::retry("remember", 2, 0))
            },
        );

        let _ = executor.execute_resilient(|| Err::<(), _>(RemoteError::BadRequest));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Some(RemoteError::BadRequest), 0, 1),
                (Some(RemoteError::BadRequest), 1, 2),
                (Some(RemoteError::BadRequest), 2, 3),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]

        #[test]
        fn attempts_are_retry_budget_plus_one(max_retries in 0u32..8) {
            let executor = ResilientActionExecutor::new("prop").with_consultant(always_retry(max_retries, 0));
            let attempts = Cell::new(0u32);

            let result: Result<(), _> = executor.execute_resilient(|| {
                attempts.set(attempts.get() + 1);
                Err(RemoteError::Boom)
            });

            prop_assert_eq!(result, Err(RemoteError::Boom));
            prop_assert_eq!(attempts.get(), max_retries + 1);
        }
    }
}
