//! Query client
//!
//! [`QueryClient`] is the explicit context every call site shares: identity
//! derivation, the in-flight registry, the store, the transport and the
//! suspension capability. Construct one per application session and call
//! [`QueryClient::shutdown`] when the session ends.

use futures::FutureExt;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, trace, warn};

use crate::{
    ClientConfig, ErrorPolicy, FetchPolicy, Identity, IdentityDeriver, QueryDescriptor,
    QueryError, QueryOptions, QueryRef,
    identity::VariableSanitizer,
    refetch::MergeFn,
    reference::{NetworkStatus, QueryResult, RefEntry, RefSnapshot, ReleaseHook, UpdateMode},
    registry::{InFlightGuard, InFlightRegistry},
    store::{CacheStatus, MemoryStore, QueryStore, StoreRead},
    suspense::{AwaitSuspender, Suspender, read_suspending},
    transport::{FetchResponse, Transport},
};

/// A held reference together with the result its suspending read produced
#[derive(Debug)]
pub struct QueryRead {
    pub reference: QueryRef,
    pub result: QueryResult,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) deriver: IdentityDeriver,
    pub(crate) registry: InFlightRegistry,
    pub(crate) store: Arc<dyn QueryStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) suspender: Arc<dyn Suspender>,
    refs: Mutex<HashMap<Identity, Arc<RefEntry>>>,
}

/// Shared coordination context
#[derive(Clone)]
pub struct QueryClient {
    pub(crate) inner: Arc<ClientInner>,
}

/// Builder for a [`QueryClient`] with custom collaborators
pub struct QueryClientBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn QueryStore>>,
    sanitizer: Option<Arc<dyn VariableSanitizer>>,
    suspender: Option<Arc<dyn Suspender>>,
}

impl QueryClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(self, store: impl QueryStore) -> Self {
        self.shared_store(Arc::new(store))
    }

    /// Use a store the caller keeps a handle to
    pub fn shared_store(mut self, store: Arc<dyn QueryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sanitizer(mut self, sanitizer: impl VariableSanitizer) -> Self {
        self.sanitizer = Some(Arc::new(sanitizer));
        self
    }

    pub fn suspender(mut self, suspender: impl Suspender) -> Self {
        self.suspender = Some(Arc::new(suspender));
        self
    }

    pub fn build(self) -> QueryClient {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(&self.config)));
        let deriver = match self.sanitizer {
            Some(sanitizer) => IdentityDeriver::with_shared_sanitizer(sanitizer),
            None => IdentityDeriver::default(),
        };
        let suspender = self
            .suspender
            .unwrap_or_else(|| Arc::new(AwaitSuspender));

        QueryClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                deriver,
                registry: InFlightRegistry::new(),
                store,
                transport: self.transport,
                suspender,
                refs: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// What a fetch task must do once the transport answers
pub(crate) struct FetchRequest {
    pub(crate) identity: Identity,
    pub(crate) variables: Value,
    pub(crate) fetch_policy: FetchPolicy,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) page: Option<PageMerge>,
}

/// Merges a fetched page into the reference's data at arrival time
pub(crate) struct PageMerge {
    pub(crate) base: watch::Receiver<RefSnapshot>,
    pub(crate) merge: MergeFn,
}

struct FetchPlan {
    initial: RefSnapshot,
    fetch: Option<UpdateMode>,
}

fn plan_fetch(options: &QueryOptions, cached: StoreRead) -> FetchPlan {
    use CacheStatus::{Hit, Partial};
    use FetchPolicy::*;

    let refresh = |data| FetchPlan {
        initial: RefSnapshot::fulfilled(data, NetworkStatus::Loading),
        fetch: Some(UpdateMode::Quiet(NetworkStatus::Loading)),
    };

    match (options.fetch_policy, cached.status) {
        (CacheFirst, Hit) => FetchPlan {
            initial: RefSnapshot::fulfilled(cached.data, NetworkStatus::Ready),
            fetch: None,
        },
        (CacheAndNetwork, Hit) => refresh(cached.data),
        (CacheFirst | CacheAndNetwork, Partial) if options.return_partial_data => {
            refresh(cached.data)
        }
        (CacheOnly | Standby, _) => FetchPlan {
            initial: RefSnapshot::fulfilled(cached.data, NetworkStatus::Ready),
            fetch: None,
        },
        _ => FetchPlan {
            initial: RefSnapshot::pending(),
            fetch: Some(UpdateMode::Suspend(NetworkStatus::Loading)),
        },
    }
}

/// Fetch a request starts against a reference that already settled
fn reuse_fetch(options: &QueryOptions, in_transition: bool) -> Option<UpdateMode> {
    use FetchPolicy::*;

    match options.fetch_policy {
        CacheAndNetwork => Some(UpdateMode::Quiet(NetworkStatus::Loading)),
        NetworkOnly | NoCache if in_transition => Some(UpdateMode::Quiet(NetworkStatus::Loading)),
        NetworkOnly | NoCache => Some(UpdateMode::Suspend(NetworkStatus::Loading)),
        CacheFirst | CacheOnly | Standby => None,
    }
}

fn validate_fetch_policy(policy: FetchPolicy, context: &'static str) -> Result<(), QueryError> {
    if policy.can_settle() {
        Ok(())
    } else {
        Err(QueryError::PolicyConflict { policy, context })
    }
}

fn should_write(request: &FetchRequest, response: &FetchResponse) -> bool {
    request.fetch_policy != FetchPolicy::NoCache
        && (!response.has_errors() || request.error_policy != ErrorPolicy::None)
}

impl QueryClient {
    pub fn new(transport: impl Transport, config: ClientConfig) -> Self {
        Self::builder(transport).config(config).build()
    }

    pub fn builder(transport: impl Transport) -> QueryClientBuilder {
        QueryClientBuilder {
            config: ClientConfig::default(),
            transport: Arc::new(transport),
            store: None,
            sanitizer: None,
            suspender: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Options requests start from, per the client config
    pub fn default_options(&self) -> QueryOptions {
        self.inner.config.default_options.clone()
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn QueryStore> {
        &self.inner.store
    }

    /// Identity a request with these options resolves to
    pub fn identity(
        &self,
        query: &Arc<QueryDescriptor>,
        variables: Value,
        options: &QueryOptions,
    ) -> Identity {
        self.inner
            .deriver
            .derive(query, variables, options.disambiguation_key.as_deref())
    }

    /// Suspending read: obtain the reference for the request and read it,
    /// suspending until its fetch settles when it is pending.
    ///
    /// Returns `Ok(None)` for skipped requests. Policy conflicts are returned
    /// before any registry activity. A read that raises an error releases its
    /// hold on the reference.
    pub async fn read_query(
        &self,
        query: &Arc<QueryDescriptor>,
        variables: Value,
        options: QueryOptions,
    ) -> Result<Option<QueryRead>, QueryError> {
        let Some(reference) = self
            .obtain(query, variables, &options, "a suspending read")
            .await?
        else {
            return Ok(None);
        };

        match self.read(&reference).await {
            Ok(result) => Ok(Some(QueryRead { reference, result })),
            Err(err) => {
                reference.dispose().await;
                Err(err)
            }
        }
    }

    /// Suspending read of a reference obtained elsewhere (e.g. preloaded)
    pub async fn read(&self, reference: &QueryRef) -> Result<QueryResult, QueryError> {
        read_suspending(reference, self.inner.suspender.as_ref()).await
    }

    /// End the session: every live reference is disposed. Fetches still in
    /// flight run to completion but no reference observes them.
    pub async fn shutdown(&self) {
        let mut refs = self.inner.refs.lock().await;
        debug!("Shutting down query client with {} references", refs.len());
        for (_, entry) in refs.drain() {
            entry.mark_disposed();
        }
    }

    /// Get or create the reference for a request, starting its fetch
    /// through the registry when the store cannot satisfy it.
    pub(crate) async fn obtain(
        &self,
        query: &Arc<QueryDescriptor>,
        variables: Value,
        options: &QueryOptions,
        context: &'static str,
    ) -> Result<Option<QueryRef>, QueryError> {
        validate_fetch_policy(options.fetch_policy, context)?;
        if options.skip {
            debug!("Skipping {} of {}", context, query.name());
            return Ok(None);
        }

        let identity = self.identity(query, variables, options);
        let mut refs = self.inner.refs.lock().await;

        if let Some(existing) = refs.get(&identity) {
            if existing.identity().query().document() != query.document() {
                warn!("Identity collision on {}", identity);
                return Err(QueryError::IdentityCollision {
                    identity: identity.to_string(),
                });
            }
            if !existing.is_disposed() {
                let existing = Arc::clone(existing);
                debug!("Reusing reference for {}", identity);
                if existing.has_outstanding_fetch() {
                    trace!("Joining the outstanding fetch for {}", identity);
                } else if let Some(mode) =
                    reuse_fetch(options, self.inner.suspender.is_in_transition())
                {
                    debug!("{} requires the network for {}", options.fetch_policy, identity);
                    self.start_fetch(&existing, options, mode).await;
                }
                return Ok(Some(existing.retain(options.clone())));
            }
        }

        let cached = match options.fetch_policy {
            FetchPolicy::NetworkOnly | FetchPolicy::NoCache => StoreRead::miss(),
            _ => self.inner.store.read(&identity).await,
        };
        let plan = plan_fetch(options, cached);

        let entry = RefEntry::new(identity.clone(), plan.initial, self.release_hook());
        entry.watch_store(self.inner.store.as_ref());

        if let Some(mode) = plan.fetch {
            self.start_fetch(&entry, options, mode).await;
        } else {
            debug!("Serving {} from the store", identity);
        }

        let reference = entry.retain(options.clone());
        refs.insert(identity, entry);
        Ok(Some(reference))
    }

    /// Join or start the registered fetch for an entry's identity
    async fn start_fetch(&self, entry: &Arc<RefEntry>, options: &QueryOptions, mode: UpdateMode) {
        let identity = entry.identity();
        let request = FetchRequest {
            identity: identity.clone(),
            variables: Value::clone(identity.variables()),
            fetch_policy: options.fetch_policy,
            error_policy: options.error_policy,
            page: None,
        };
        let handle = self
            .inner
            .registry
            .acquire(identity, |guard| self.spawn_fetch(guard, request))
            .await;
        entry.begin_fetch(handle, mode);
    }

    fn release_hook(&self) -> ReleaseHook {
        let client: Weak<ClientInner> = Arc::downgrade(&self.inner);
        Arc::new(move |entry: Arc<RefEntry>| {
            let client = client.clone();
            async move {
                let Some(inner) = client.upgrade() else {
                    entry.mark_disposed();
                    return;
                };

                let mut refs = inner.refs.lock().await;
                // A holder may have been added while we waited for the lock
                if entry.holders() > 0 || entry.is_disposed() {
                    return;
                }
                if refs
                    .get(entry.identity())
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    refs.remove(entry.identity());
                }
                entry.mark_disposed();
                drop(refs);

                inner.registry.release(entry.identity()).await;
            }
            .boxed()
        })
    }

    /// Run one network operation for a registered fetch
    pub(crate) fn spawn_fetch(&self, guard: InFlightGuard, request: FetchRequest) {
        let transport = Arc::clone(&self.inner.transport);
        let store = Arc::clone(&self.inner.store);

        tokio::spawn(async move {
            let identity = &request.identity;
            debug!("Fetching {} (fetch {})", identity, guard.generation());

            let outcome = match transport.execute(identity.query(), &request.variables).await {
                Ok(mut response) => {
                    if let Some(page) = &request.page
                        && let Some(incoming) = response.data.take()
                    {
                        let base = page.base.borrow().data.clone();
                        response.data = Some(match base {
                            Some(existing) => (page.merge)(&existing, &incoming),
                            None => incoming,
                        });
                    }

                    if response.has_errors() {
                        warn!(
                            "Fetch for {} returned {} errors",
                            identity,
                            response.errors.len()
                        );
                    }
                    if !guard.is_current().await {
                        debug!(
                            "Fetch {} for {} was superseded; not writing to the store",
                            guard.generation(),
                            identity
                        );
                    } else if should_write(&request, &response)
                        && let Some(data) = &response.data
                    {
                        store.write(identity, Arc::new(data.clone())).await;
                    }
                    Ok(response)
                }
                Err(e) => {
                    error!("Transport error for {}: {}", identity, e);
                    Err(QueryError::from(e))
                }
            };

            guard.complete(outcome).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn cached(status: CacheStatus) -> StoreRead {
        StoreRead {
            status,
            data: (status != CacheStatus::Miss).then(|| Arc::new(json!({"name": "Ada"}))),
        }
    }

    #[test]
    fn test_plan_cache_first() {
        let options = QueryOptions::default();

        let hit = plan_fetch(&options, cached(CacheStatus::Hit));
        assert!(hit.fetch.is_none());
        assert_eq!(hit.initial.network_status, NetworkStatus::Ready);

        // Partial data without opting in suspends like a miss
        let partial = plan_fetch(&options, cached(CacheStatus::Partial));
        assert!(matches!(partial.fetch, Some(UpdateMode::Suspend(_))));
        assert!(partial.initial.data.is_none());

        let opted_in = plan_fetch(
            &options.clone().with_partial_data(true),
            cached(CacheStatus::Partial),
        );
        assert!(matches!(opted_in.fetch, Some(UpdateMode::Quiet(_))));
        assert!(opted_in.initial.data.is_some());
    }

    #[test]
    fn test_plan_cache_and_network_refreshes_hits() {
        let options = QueryOptions::default().with_fetch_policy(FetchPolicy::CacheAndNetwork);

        let hit = plan_fetch(&options, cached(CacheStatus::Hit));
        assert!(matches!(hit.fetch, Some(UpdateMode::Quiet(NetworkStatus::Loading))));
        assert_eq!(hit.initial.network_status, NetworkStatus::Loading);

        let miss = plan_fetch(&options, cached(CacheStatus::Miss));
        assert!(matches!(miss.fetch, Some(UpdateMode::Suspend(_))));
    }

    #[test]
    fn test_reused_reference_fetches_per_request_policy() {
        let with = |policy| QueryOptions::default().with_fetch_policy(policy);

        assert!(reuse_fetch(&with(FetchPolicy::CacheFirst), false).is_none());
        assert!(matches!(
            reuse_fetch(&with(FetchPolicy::NetworkOnly), false),
            Some(UpdateMode::Suspend(NetworkStatus::Loading))
        ));
        assert!(matches!(
            reuse_fetch(&with(FetchPolicy::NoCache), true),
            Some(UpdateMode::Quiet(_))
        ));
        assert!(matches!(
            reuse_fetch(&with(FetchPolicy::CacheAndNetwork), false),
            Some(UpdateMode::Quiet(_))
        ));
    }

    #[test]
    fn test_non_settling_policies_conflict() {
        assert!(validate_fetch_policy(FetchPolicy::NetworkOnly, "a suspending read").is_ok());
        assert!(matches!(
            validate_fetch_policy(FetchPolicy::CacheOnly, "a suspending read"),
            Err(QueryError::PolicyConflict {
                policy: FetchPolicy::CacheOnly,
                ..
            })
        ));
    }
}
