use crate::context::ResilienceContext;
use crate::proposal::ResilienceProposal;

/// Inspects a failure and optionally proposes how to react.
///
/// Return `None` for errors this consultant does not understand; the next
/// registered consultant is asked, and if nobody answers the error propagates
/// unchanged.
pub trait ResilienceConsultant<E>: Send + Sync {
    fn consult(&self, context: &mut ResilienceContext<E>) -> Option<ResilienceProposal>;
}

impl<E, F> ResilienceConsultant<E> for F
where
    F: Fn(&mut ResilienceContext<E>) -> Option<ResilienceProposal> + Send + Sync,
{
    fn consult(&self, context: &mut ResilienceContext<E>) -> Option<ResilienceProposal> {
        self(context)
    }
}
