//! Background initiation
//!
//! Starts a fetch without suspending the caller. The returned reference can
//! be handed to an unrelated, deeper consumer that reads it later, so
//! sibling requests start together instead of waiting on each other.

use serde_json::Value;
use std::sync::Arc;

use crate::{QueryClient, QueryDescriptor, QueryError, QueryOptions, QueryRef};

impl QueryClient {
    /// Start (or join) the fetch for a request and return a held reference.
    ///
    /// The reference is pending on a miss, or already fulfilled when the
    /// store has the result (or partial data and the request opts in).
    /// Returns `Ok(None)` for skipped requests.
    pub async fn preload(
        &self,
        query: &Arc<QueryDescriptor>,
        variables: Value,
        options: QueryOptions,
    ) -> Result<Option<QueryRef>, QueryError> {
        self.obtain(query, variables, &options, "background initiation")
            .await
    }
}
