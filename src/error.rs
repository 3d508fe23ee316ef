//! Query error types

use std::sync::Arc;

use crate::{FetchPolicy, transport::ResponseError};

/// Boxed error type returned by collaborators (transport, custom stores)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Query coordination errors
///
/// Errors are cheap to clone: every reader of an identity observes the same
/// settled error, so collaborator errors are shared behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("Transport error: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Result error: {}", summarize(.0))]
    Result(Arc<[ResponseError]>),

    #[error("Fetch policy '{policy}' cannot be used with {context}: it never settles")]
    PolicyConflict {
        policy: FetchPolicy,
        context: &'static str,
    },

    #[error("Identity collision: {identity} is already bound to a different query document")]
    IdentityCollision { identity: String },

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("Fetch was cancelled or panicked")]
    Cancelled,

    #[error("Query reference for {0} has been disposed")]
    Disposed(String),
}

impl QueryError {
    /// Build a `Result` error from the structured errors of a response
    pub fn result(errors: impl Into<Arc<[ResponseError]>>) -> Self {
        QueryError::Result(errors.into())
    }

    /// Structured server errors carried by this error, if any
    pub fn response_errors(&self) -> &[ResponseError] {
        match self {
            QueryError::Result(errors) => errors,
            _ => &[],
        }
    }
}

impl From<BoxError> for QueryError {
    fn from(err: BoxError) -> Self {
        QueryError::Transport(Arc::from(err))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(Arc::new(err))
    }
}

fn summarize(errors: &[ResponseError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
