//! Transition context
//!
//! A transition marks work as non-urgent: refetches started inside one keep
//! the current snapshot visible instead of suspending readers. The flag is
//! task-local, so it does not follow work handed to `tokio::spawn`.

use std::future::Future;

tokio::task_local! {
    static IN_TRANSITION: bool;
}

/// Run `future` inside a transition context
pub async fn start_transition<F: Future>(future: F) -> F::Output {
    IN_TRANSITION.scope(true, future).await
}

pub fn is_in_transition() -> bool {
    IN_TRANSITION.try_with(|flag| *flag).unwrap_or(false)
}
