//! Error policy filter
//!
//! Decides what a settled fetch outcome looks like to a reader: a thrown
//! error, or data with an optional error field next to it.

use serde_json::Value;
use std::sync::Arc;

use crate::{ErrorPolicy, QueryError, transport::FetchOutcome};

/// What a reader sees for one settled outcome
#[derive(Debug, Clone, Default)]
pub struct Classified {
    /// Error the read must raise instead of returning
    pub throwable: Option<QueryError>,
    pub data: Option<Arc<Value>>,
    /// Error surfaced alongside data
    pub error: Option<QueryError>,
}

/// Whether the outcome carries any error, before policy is applied
pub fn is_failure(outcome: &FetchOutcome) -> bool {
    match outcome {
        Ok(response) => response.has_errors(),
        Err(_) => true,
    }
}

/// Data and error of an outcome, before any policy is applied
pub fn outcome_parts(outcome: &FetchOutcome) -> (Option<Arc<Value>>, Option<QueryError>) {
    match outcome {
        Ok(response) => {
            let data = response.data.clone().map(Arc::new);
            let error = response
                .has_errors()
                .then(|| QueryError::result(response.errors.clone()));
            (data, error)
        }
        Err(err) => (None, Some(err.clone())),
    }
}

/// Classify a fetch outcome under an error policy. Pure.
pub fn classify(policy: ErrorPolicy, outcome: &FetchOutcome) -> Classified {
    let (data, error) = outcome_parts(outcome);
    apply(policy, data, error)
}

/// Apply an error policy to data and the error that came with it.
///
/// Settled references keep both unfiltered so each holder can apply its
/// own policy at read time.
pub fn apply(policy: ErrorPolicy, data: Option<Arc<Value>>, error: Option<QueryError>) -> Classified {
    match (policy, error) {
        (_, None) => Classified {
            throwable: None,
            data,
            error: None,
        },
        (ErrorPolicy::None, Some(err)) => Classified {
            throwable: Some(err),
            data: None,
            error: None,
        },
        (ErrorPolicy::All, Some(err)) => Classified {
            throwable: None,
            data,
            error: Some(err),
        },
        (ErrorPolicy::Ignore, Some(_)) => Classified {
            throwable: None,
            data,
            error: None,
        },
    }
}
