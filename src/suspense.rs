//! Suspense coordination
//!
//! A [`Suspender`] is the rendering layer's capability to pause a unit of
//! work until a [`PendingSignal`] resolves. [`read_suspending`] drives the
//! read protocol on top of it: read, suspend while pending, read again.

use tracing::{debug, trace};

use crate::{
    QueryError, QueryRef,
    reference::{PendingSignal, QueryResult, Read},
    transition,
};

#[async_trait::async_trait]
pub trait Suspender: Send + Sync + 'static {
    /// Pause the current unit of work until `signal` resolves
    async fn suspend_until(&self, signal: PendingSignal);

    /// Whether the caller runs inside a non-urgent transition
    fn is_in_transition(&self) -> bool {
        transition::is_in_transition()
    }
}

/// Suspends by awaiting the signal in place
#[derive(Debug, Clone, Copy, Default)]
pub struct AwaitSuspender;

#[async_trait::async_trait]
impl Suspender for AwaitSuspender {
    async fn suspend_until(&self, signal: PendingSignal) {
        signal.resolved().await;
    }
}

/// Read `reference`, suspending through `suspender` while it is pending
pub async fn read_suspending(
    reference: &QueryRef,
    suspender: &dyn Suspender,
) -> Result<QueryResult, QueryError> {
    let mut suspensions = 0u32;
    loop {
        match reference.read()? {
            Read::Ready(result) => {
                if suspensions > 0 {
                    trace!(
                        "Resumed read of {} after {} suspensions",
                        reference.identity(),
                        suspensions
                    );
                }
                return Ok(result);
            }
            Read::Suspend(signal) => {
                suspensions += 1;
                debug!(
                    "Suspending read of {} until its fetch settles",
                    reference.identity()
                );
                suspender.suspend_until(signal).await;
            }
        }
    }
}
