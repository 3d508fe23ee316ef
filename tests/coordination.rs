use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::future::join_all;
use pquery::{
    BoxError, ErrorPolicy, FetchPolicy, FetchResponse, MemoryStore, NetworkStatus,
    QueryClient, QueryDescriptor, QueryError, QueryOptions, QueryStatus, QueryStore, Read,
    ResponseError, Transport, async_trait,
};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

type Respond = Box<dyn Fn(usize, &Value) -> Result<FetchResponse, BoxError> + Send + Sync>;

/// Transport whose calls can be held open until the test releases them
struct Scripted {
    calls: AtomicUsize,
    completed: AtomicUsize,
    gates: HashMap<usize, Semaphore>,
    respond: Respond,
}

impl Scripted {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(usize, &Value) -> Result<FetchResponse, BoxError> + Send + Sync + 'static,
    {
        Self::gated(&[], respond)
    }

    /// Calls with an index in `gated` wait for [`Scripted::open`]
    fn gated<F>(gated: &[usize], respond: F) -> Arc<Self>
    where
        F: Fn(usize, &Value) -> Result<FetchResponse, BoxError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            gates: gated.iter().map(|&i| (i, Semaphore::new(0))).collect(),
            respond: Box::new(respond),
        })
    }

    fn open(&self, call: usize) {
        self.gates[&call].add_permits(1);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

struct Shared(Arc<Scripted>);

#[async_trait]
impl Transport for Shared {
    async fn execute(
        &self,
        _query: &QueryDescriptor,
        variables: &Value,
    ) -> Result<FetchResponse, BoxError> {
        let call = self.0.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.0.gates.get(&call) {
            let _permit = gate.acquire().await?;
        }
        let response = (self.0.respond)(call, variables);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
        response
    }
}

/// Suspender that counts how often a read had to wait
#[derive(Clone, Default)]
struct CountingSuspender {
    suspensions: Arc<AtomicUsize>,
}

#[async_trait]
impl pquery::suspense::Suspender for CountingSuspender {
    async fn suspend_until(&self, signal: pquery::PendingSignal) {
        self.suspensions.fetch_add(1, Ordering::SeqCst);
        signal.resolved().await;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(transport: &Arc<Scripted>) -> QueryClient {
    init_tracing();
    QueryClient::builder(Shared(Arc::clone(transport))).build()
}

fn dog_query() -> Arc<QueryDescriptor> {
    Arc::new(
        QueryDescriptor::new("Dog", "query Dog($id: ID!) { dog(id: $id) { name } }")
            .with_fields(["dog"]),
    )
}

fn dog(name: &str) -> Value {
    json!({"dog": {"name": name}})
}

/// Yield until `cond` holds
async fn until(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let transport = Scripted::gated(&[0], |_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let query = dog_query();

    let reads = join_all(
        (0..10).map(|_| client.read_query(&query, json!({"id": "1"}), QueryOptions::default())),
    );
    let release = async {
        until(|| transport.calls() == 1).await;
        transport.open(0);
    };
    let (results, ()) = tokio::join!(reads, release);

    assert_eq!(transport.calls(), 1);
    let reads: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
    for read in &reads {
        assert_eq!(read.result.data.as_deref(), Some(&dog("Rex")));
        assert!(read.reference.same_reference(&reads[0].reference));
    }
    assert_eq!(reads[0].reference.holders(), 10);

    for read in reads {
        read.reference.dispose().await;
    }
    assert!(client.registry().is_empty().await);
}

#[tokio::test]
async fn test_disambiguation_key_separates_identities() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    init_tracing();
    let config = pquery::ClientConfig {
        default_options: QueryOptions::default().with_fetch_policy(FetchPolicy::NetworkOnly),
        ..Default::default()
    };
    let client = QueryClient::new(Shared(Arc::clone(&transport)), config);
    let query = dog_query();
    let options = client.default_options();
    assert_eq!(options.fetch_policy, FetchPolicy::NetworkOnly);

    let plain = client
        .read_query(&query, json!({"id": "1"}), options.clone())
        .await
        .unwrap()
        .unwrap();
    let keyed = client
        .read_query(
            &query,
            json!({"id": "1"}),
            options.with_disambiguation_key("sidebar"),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(transport.calls(), 2);
    assert!(!plain.reference.same_reference(&keyed.reference));
    assert_ne!(plain.reference.identity(), keyed.reference.identity());
}

#[tokio::test]
async fn test_pending_read_suspends_once_then_resumes() {
    let transport = Scripted::gated(&[0], |_, _| Ok(FetchResponse::data(dog("Rex"))));
    let suspender = CountingSuspender::default();
    let client = QueryClient::builder(Shared(Arc::clone(&transport)))
        .suspender(suspender.clone())
        .build();
    let query = dog_query();

    // Background initiation returns at once, before the fetch settles
    let reference = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.status(), QueryStatus::Pending);
    assert!(matches!(reference.read().unwrap(), Read::Suspend(_)));

    let release = async {
        until(|| transport.calls() == 1).await;
        transport.open(0);
    };
    let (result, ()) = tokio::join!(client.read(&reference), release);
    assert_eq!(result.unwrap().data.as_deref(), Some(&dog("Rex")));
    assert_eq!(suspender.suspensions.load(Ordering::SeqCst), 1);

    // Settled: no further suspension, no further fetch
    let again = client.read(&reference).await.unwrap();
    assert_eq!(again.data.as_deref(), Some(&dog("Rex")));
    assert_eq!(suspender.suspensions.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls(), 1);

    reference.dispose().await;
}

#[tokio::test]
async fn test_partial_data_returns_immediately_and_completes_in_place() {
    let transport = Scripted::gated(&[0], |_, _| {
        Ok(FetchResponse::data(
            json!({"name": "Ada", "email": "ada@example.com"}),
        ))
    });
    let store = Arc::new(MemoryStore::default());
    let client = QueryClient::builder(Shared(Arc::clone(&transport)))
        .shared_store(store.clone())
        .build();
    let query = Arc::new(
        QueryDescriptor::new("Profile", "query Profile { name email }")
            .with_fields(["name", "email"]),
    );
    let options = QueryOptions::default().with_partial_data(true);

    let identity = client.identity(&query, json!({}), &options);
    store.write(&identity, Arc::new(json!({"name": "Ada"}))).await;

    // The gate is closed: this must not wait for the network
    let read = client
        .read_query(&query, json!({}), options)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.result.data.as_deref(), Some(&json!({"name": "Ada"})));
    assert_eq!(read.result.network_status, NetworkStatus::Loading);
    assert!(client.registry().contains(&identity).await);

    until(|| transport.calls() == 1).await;
    transport.open(0);

    let mut rx = read.reference.watch();
    let settled = rx
        .wait_for(|s| s.network_status == NetworkStatus::Ready)
        .await
        .unwrap()
        .clone();
    assert_eq!(settled.status, QueryStatus::Fulfilled);
    assert_eq!(
        settled.data.as_deref(),
        Some(&json!({"name": "Ada", "email": "ada@example.com"}))
    );
    assert_eq!(
        store.read(&identity).await.status,
        pquery::CacheStatus::Hit
    );
}

#[tokio::test]
async fn test_refetch_in_transition_keeps_snapshot_visible() {
    let transport = Scripted::gated(&[1], |call, _| {
        Ok(FetchResponse::data(dog(if call == 0 { "Rex" } else { "Fido" })))
    });
    let client = client(&transport);
    let query = dog_query();

    let read = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    let reference = read.reference;

    let observe = async {
        until(|| transport.calls() == 2).await;
        // Still the old snapshot, never pending
        let Read::Ready(current) = reference.read().unwrap() else {
            panic!("transition refetch must not suspend readers");
        };
        assert_eq!(current.data.as_deref(), Some(&dog("Rex")));
        assert_eq!(current.network_status, NetworkStatus::Refetch);
        assert_eq!(reference.status(), QueryStatus::Fulfilled);
        transport.open(1);
    };
    let (refetched, ()) = tokio::join!(
        pquery::transition::start_transition(client.refetch(&reference)),
        observe
    );

    assert_eq!(refetched.unwrap().data.as_deref(), Some(&dog("Fido")));
    let Read::Ready(current) = reference.read().unwrap() else {
        panic!("settled reference must be readable");
    };
    assert_eq!(current.data.as_deref(), Some(&dog("Fido")));
    assert_eq!(current.network_status, NetworkStatus::Ready);
}

#[tokio::test]
async fn test_refetch_outside_transition_suspends_readers() {
    let transport = Scripted::gated(&[1], |call, _| {
        Ok(FetchResponse::data(dog(if call == 0 { "Rex" } else { "Fido" })))
    });
    let client = client(&transport);
    let query = dog_query();

    let reference = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap()
        .reference;

    let observe = async {
        until(|| transport.calls() == 2).await;
        let Read::Suspend(signal) = reference.read().unwrap() else {
            panic!("refetch outside a transition must suspend readers");
        };
        assert_eq!(reference.snapshot().network_status, NetworkStatus::Refetch);
        transport.open(1);
        signal.resolved().await;
        reference.read().unwrap()
    };
    let (refetched, after) = tokio::join!(client.refetch(&reference), observe);

    assert_eq!(refetched.unwrap().data.as_deref(), Some(&dog("Fido")));
    let Read::Ready(current) = after else {
        panic!("resolved signal must leave the reference readable");
    };
    assert_eq!(current.data.as_deref(), Some(&dog("Fido")));
}

#[tokio::test]
async fn test_latest_fetch_wins() {
    let transport = Scripted::gated(&[0, 1], |call, _| {
        Ok(FetchResponse::data(dog(if call == 0 { "stale" } else { "fresh" })))
    });
    let client = client(&transport);
    let query = dog_query();

    let reference = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    let drive = async {
        until(|| transport.calls() == 2).await;
        // Newer fetch settles first, the superseded one afterwards
        transport.open(1);
        let mut rx = reference.watch();
        rx.wait_for(|s| s.status == QueryStatus::Fulfilled)
            .await
            .unwrap();
        transport.open(0);
        until(|| transport.completed() == 2).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    };
    let (refetched, ()) = tokio::join!(client.refetch(&reference), drive);

    assert_eq!(refetched.unwrap().data.as_deref(), Some(&dog("fresh")));
    assert_eq!(reference.snapshot().data.as_deref(), Some(&dog("fresh")));
    assert!(client.registry().is_empty().await);
}

#[tokio::test]
async fn test_fetch_more_merges_pages_in_place() {
    let transport = Scripted::new(|_, variables| {
        let offset = variables["offset"].as_u64().unwrap_or(0);
        Ok(FetchResponse::data(
            json!({"items": [offset + 1, offset + 2]}),
        ))
    });
    let client = client(&transport);
    let query = Arc::new(QueryDescriptor::new(
        "Items",
        "query Items($offset: Int) { items(offset: $offset) }",
    ));

    let reference = client
        .read_query(&query, json!({"offset": 0}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap()
        .reference;
    let identity = reference.identity().clone();

    let merged = client
        .fetch_more(&reference, json!({"offset": 2}), |existing, page| {
            let mut items = existing["items"].as_array().cloned().unwrap_or_default();
            items.extend(page["items"].as_array().cloned().unwrap_or_default());
            json!({ "items": items })
        })
        .await
        .unwrap();

    assert_eq!(merged.data.as_deref(), Some(&json!({"items": [1, 2, 3, 4]})));
    assert_eq!(
        reference.snapshot().data.as_deref(),
        Some(&json!({"items": [1, 2, 3, 4]}))
    );
    assert_eq!(reference.identity(), &identity);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_error_policy_matrix() {
    let failing = || {
        Scripted::new(|_, _| {
            Ok(FetchResponse {
                data: Some(dog("Rex")),
                errors: vec![ResponseError::new("owner unavailable")],
            })
        })
    };
    let query = dog_query();

    // none: the read raises
    let transport = failing();
    let throwing = client(&transport);
    let err = throwing
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Result(_)));
    assert_eq!(err.response_errors()[0].message, "owner unavailable");

    // all: data and error side by side
    let transport = failing();
    let surfacing = client(&transport);
    let read = surfacing
        .read_query(
            &query,
            json!({"id": "1"}),
            QueryOptions::default().with_error_policy(ErrorPolicy::All),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.result.data.as_deref(), Some(&dog("Rex")));
    assert!(matches!(read.result.error, Some(QueryError::Result(_))));
    assert_eq!(read.reference.status(), QueryStatus::Rejected);

    // ignore: data only
    let transport = failing();
    let ignoring = client(&transport);
    let read = ignoring
        .read_query(
            &query,
            json!({"id": "1"}),
            QueryOptions::default().with_error_policy(ErrorPolicy::Ignore),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.result.data.as_deref(), Some(&dog("Rex")));
    assert!(read.result.error.is_none());
}

#[tokio::test]
async fn test_transport_failure_is_shared_and_retryable() {
    let transport = Scripted::new(|call, _| {
        if call == 0 {
            Err("connection reset".into())
        } else {
            Ok(FetchResponse::data(dog("Rex")))
        }
    });
    let client = client(&transport);
    let query = dog_query();

    let err = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Transport(_)));

    // The failed read released the reference: a new read fetches again
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let read = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.result.data.as_deref(), Some(&dog("Rex")));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_skip_never_touches_the_registry() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let query = dog_query();
    let options = QueryOptions::default().with_skip(true);

    assert!(
        client
            .read_query(&query, json!({"id": "1"}), options.clone())
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        client
            .preload(&query, json!({"id": "1"}), options)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(transport.calls(), 0);
    assert!(client.registry().is_empty().await);
}

#[tokio::test]
async fn test_non_settling_policies_are_rejected_at_call_time() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let query = dog_query();

    let err = client
        .read_query(
            &query,
            json!({"id": "1"}),
            QueryOptions::default().with_fetch_policy(FetchPolicy::CacheOnly),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::PolicyConflict {
            policy: FetchPolicy::CacheOnly,
            ..
        }
    ));

    // Skipping does not hide the conflict
    let err = client
        .preload(
            &query,
            json!({"id": "1"}),
            QueryOptions::default()
                .with_fetch_policy(FetchPolicy::Standby)
                .with_skip(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::PolicyConflict { .. }));

    assert_eq!(transport.calls(), 0);
    assert!(client.registry().is_empty().await);
}

#[tokio::test]
async fn test_dispose_while_pending_keeps_fetch_for_resubscribe() {
    let transport = Scripted::gated(&[0], |_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let query = dog_query();

    let first = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    let identity = first.identity().clone();
    first.dispose().await;

    assert!(client.registry().contains(&identity).await);
    assert_eq!(client.registry().subscriber_count(&identity).await, Some(0));

    let second = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.registry().subscriber_count(&identity).await, Some(1));

    until(|| transport.calls() >= 1).await;
    transport.open(0);
    let result = second.settled().await.unwrap();

    assert_eq!(result.data.as_deref(), Some(&dog("Rex")));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_identity_collision_is_detected() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let first = Arc::new(QueryDescriptor::new("Dog", "query Dog { dog { name } }").with_id("q1"));
    let second =
        Arc::new(QueryDescriptor::new("Dog", "query Dog { dog { breed } }").with_id("q1"));

    let _held = client
        .preload(&first, json!({}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    let err = client
        .preload(&second, json!({}), QueryOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QueryError::IdentityCollision { .. }));
}

#[tokio::test]
async fn test_cached_result_is_served_and_follows_store_writes() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    let store = Arc::new(MemoryStore::default());
    let client = QueryClient::builder(Shared(Arc::clone(&transport)))
        .shared_store(store.clone())
        .build();
    let query = dog_query();
    let options = QueryOptions::default();

    let identity = client.identity(&query, json!({"id": "1"}), &options);
    store.write(&identity, Arc::new(dog("Rex"))).await;

    let reference = client
        .preload(&query, json!({"id": "1"}), options)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.status(), QueryStatus::Fulfilled);
    assert_eq!(transport.calls(), 0);

    store.write(&identity, Arc::new(dog("Fido"))).await;
    assert_eq!(reference.snapshot().data.as_deref(), Some(&dog("Fido")));

    reference.dispose().await;
    assert_eq!(store.listener_count(&identity), 0);
}

#[tokio::test]
async fn test_shutdown_disposes_live_references() {
    let transport = Scripted::new(|_, _| Ok(FetchResponse::data(dog("Rex"))));
    let client = client(&transport);
    let query = dog_query();

    let read = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    client.shutdown().await;

    assert!(matches!(
        read.reference.read(),
        Err(QueryError::Disposed(_))
    ));
    assert!(matches!(
        client.refetch(&read.reference).await,
        Err(QueryError::Disposed(_))
    ));
}

#[tokio::test]
async fn test_joining_holder_reads_under_its_own_error_policy() {
    let transport = Scripted::new(|_, _| {
        Ok(FetchResponse {
            data: Some(dog("Rex")),
            errors: vec![ResponseError::new("owner unavailable")],
        })
    });
    let client = client(&transport);
    let query = dog_query();

    let strict = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(strict.settled().await, Err(QueryError::Result(_))));

    let lenient = client
        .read_query(
            &query,
            json!({"id": "1"}),
            QueryOptions::default().with_error_policy(ErrorPolicy::All),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(lenient.reference.same_reference(&strict));
    assert_eq!(lenient.result.data.as_deref(), Some(&dog("Rex")));
    assert!(matches!(lenient.result.error, Some(QueryError::Result(_))));

    // The first holder keeps raising under its own policy
    assert!(matches!(strict.read(), Err(QueryError::Result(_))));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_network_only_request_refreshes_existing_reference() {
    let transport = Scripted::new(|call, _| Ok(FetchResponse::data(dog(&format!("v{call}")))));
    let client = client(&transport);
    let query = dog_query();

    let first = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.result.data.as_deref(), Some(&dog("v0")));

    let fresh = client
        .read_query(
            &query,
            json!({"id": "1"}),
            QueryOptions::default().with_fetch_policy(FetchPolicy::NetworkOnly),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.result.data.as_deref(), Some(&dog("v1")));
    assert!(fresh.reference.same_reference(&first.reference));
    assert_eq!(first.reference.snapshot().data.as_deref(), Some(&dog("v1")));
    assert_eq!(transport.calls(), 2);

    // Cache-first joins without fetching
    let cached = client
        .read_query(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.result.data.as_deref(), Some(&dog("v1")));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_network_only_request_joins_outstanding_fetch() {
    let transport = Scripted::gated(&[0], |call, _| Ok(FetchResponse::data(dog(&format!("v{call}")))));
    let client = client(&transport);
    let query = dog_query();

    let pending = client
        .preload(&query, json!({"id": "1"}), QueryOptions::default())
        .await
        .unwrap()
        .unwrap();

    let read = client.read_query(
        &query,
        json!({"id": "1"}),
        QueryOptions::default().with_fetch_policy(FetchPolicy::NetworkOnly),
    );
    let release = async {
        until(|| transport.calls() == 1).await;
        transport.open(0);
    };
    let (read, ()) = tokio::join!(read, release);

    let read = read.unwrap().unwrap();
    assert!(read.reference.same_reference(&pending));
    assert_eq!(read.result.data.as_deref(), Some(&dog("v0")));
    assert_eq!(transport.calls(), 1);
}
