//! Per-invocation state handed to consultants.

use std::any::Any;
use std::collections::HashMap;

/// State of one `execute_resilient` call, shared across its attempts.
///
/// Consultants read the current error and the retry count, and may park
/// arbitrary values under a key to remember decisions between attempts.
pub struct ResilienceContext<E> {
    current_error: Option<E>,
    already_done_retries: u32,
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl<E> ResilienceContext<E> {
    pub fn new() -> Self {
        Self {
            current_error: None,
            already_done_retries: 0,
            values: HashMap::new(),
        }
    }

    /// Context as seen after a first failed attempt.
    pub fn with_error(error: E) -> Self {
        let mut context = Self::new();
        context.record_error(error);
        context
    }

    /// The error of the latest failed attempt.
    pub fn current_error(&self) -> Option<&E> {
        self.current_error.as_ref()
    }

    pub fn already_done_retries(&self) -> u32 {
        self.already_done_retries
    }

    /// Value stored under `key`, if present and of type `V`.
    pub fn value<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn set_value<V: Any + Send>(&mut self, key: impl Into<String>, value: V) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub(crate) fn record_error(&mut self, error: E) {
        self.current_error = Some(error);
    }

    pub(crate) fn count_retry(&mut self) {
        self.already_done_retries += 1;
    }
}

impl<E> Default for ResilienceContext<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: core::fmt::Debug> core::fmt::Debug for ResilienceContext<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("current_error", &self.current_error)
            .field("already_done_retries", &self.already_done_retries)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_survive_and_mismatched_types_are_none() {
        let mut ctx: ResilienceContext<String> = ResilienceContext::new();
        ctx.set_value("token.refreshed", true);
        ctx.set_value("attempted.hosts", vec!["a".to_string()]);

        assert_eq!(ctx.value::<bool>("token.refreshed"), Some(&true));
        assert!(ctx.value::<u32>("token.refreshed").is_none());
        assert_eq!(
            ctx.value::<Vec<String>>("attempted.hosts").map(Vec::len),
            Some(1)
        );
        assert!(ctx.value::<bool>("missing").is_none());
    }
}
