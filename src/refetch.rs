//! Refetch and pagination
//!
//! Follow-up fetches run under the identity of an existing reference and
//! update it in place, so every holder observes the new result. Inside a
//! transition the reference keeps its current snapshot until the result
//! lands; outside one it goes back to pending and active readers suspend.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::{
    QueryClient, QueryError, QueryRef,
    client::{FetchRequest, PageMerge},
    error_policy::classify,
    reference::{NetworkStatus, QueryResult, UpdateMode},
};

/// Combines existing data with a fetched page: `merge(existing, page)`
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

impl QueryClient {
    /// Fetch the reference's query again and replace its result
    pub async fn refetch(&self, reference: &QueryRef) -> Result<QueryResult, QueryError> {
        let variables = Value::clone(reference.identity().variables());
        self.follow_up(reference, variables, None, NetworkStatus::Refetch)
            .await
    }

    /// Fetch a page and merge it into the reference's result.
    ///
    /// `page_variables` are merged over the reference's variables for the
    /// request only; the identity does not change. Returns the merged result.
    pub async fn fetch_more<M>(
        &self,
        reference: &QueryRef,
        page_variables: Value,
        merge: M,
    ) -> Result<QueryResult, QueryError>
    where
        M: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        let page_variables = self.inner.deriver.sanitize(page_variables);
        let variables = merge_variables(reference.identity().variables(), page_variables);
        let page = PageMerge {
            base: reference.watch(),
            merge: Arc::new(merge),
        };
        self.follow_up(reference, variables, Some(page), NetworkStatus::FetchMore)
            .await
    }

    async fn follow_up(
        &self,
        reference: &QueryRef,
        variables: Value,
        page: Option<PageMerge>,
        network_status: NetworkStatus,
    ) -> Result<QueryResult, QueryError> {
        let entry = Arc::clone(reference.entry());
        if entry.is_disposed() {
            return Err(QueryError::Disposed(entry.identity().to_string()));
        }

        // Decided at call time, before the fetch starts
        let quiet = self.inner.suspender.is_in_transition();
        let options = reference.options().clone();
        let request = FetchRequest {
            identity: entry.identity().clone(),
            variables,
            fetch_policy: options.fetch_policy,
            error_policy: options.error_policy,
            page,
        };

        let handle = self
            .inner
            .registry
            .supersede(entry.identity(), |guard| self.spawn_fetch(guard, request))
            .await;

        let mode = if quiet {
            UpdateMode::Quiet(network_status)
        } else {
            UpdateMode::Suspend(network_status)
        };
        debug!(
            "{:?} for {} ({})",
            network_status,
            entry.identity(),
            if quiet { "transition" } else { "suspending" }
        );
        entry.begin_fetch(handle.clone(), mode);

        let outcome = handle.settled().await;
        // Holders must see the result by the time the caller does
        entry.settle(handle.generation(), outcome.clone());
        let classified = classify(options.error_policy, &outcome);
        match classified.throwable {
            Some(err) => Err(err),
            None => Ok(QueryResult {
                data: classified.data,
                error: classified.error,
                network_status: NetworkStatus::Ready,
            }),
        }
    }
}

fn merge_variables(base: &Value, page: Value) -> Value {
    match (base, page) {
        (Value::Object(base), Value::Object(page)) => {
            let mut merged = base.clone();
            merged.extend(page);
            Value::Object(merged)
        }
        (_, page) => page,
    }
}
