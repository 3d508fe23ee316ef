//! Query references
//!
//! A [`QueryRef`] is one holder's handle on the shared lifecycle of an
//! identity's result. Every holder of the same identity points at the same
//! entry, so they observe the same transitions through one watch channel and
//! resume together when a pending fetch settles.
//!
//! Holders are counted explicitly: [`QueryRef::retain`] adds a holder and
//! [`QueryRef::dispose`] removes one. The entry is torn down when the last
//! holder disposes.

use futures::future::BoxFuture;
use serde_json::Value;
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{
    ErrorPolicy, Identity, QueryError, QueryOptions,
    error_policy::{apply, is_failure, outcome_parts},
    registry::FetchHandle,
    store::{QueryStore, StoreSubscription},
    transport::FetchOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// What the network side of a reference is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Loading,
    Ready,
    Refetch,
    FetchMore,
    Error,
}

/// Point-in-time state of a reference
#[derive(Debug, Clone)]
pub struct RefSnapshot {
    pub status: QueryStatus,
    pub network_status: NetworkStatus,
    pub data: Option<Arc<Value>>,
    /// Failure of the last settlement, before any error policy is applied
    pub error: Option<QueryError>,
}

impl RefSnapshot {
    pub(crate) fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            network_status: NetworkStatus::Loading,
            data: None,
            error: None,
        }
    }

    pub(crate) fn fulfilled(data: Option<Arc<Value>>, network_status: NetworkStatus) -> Self {
        Self {
            status: QueryStatus::Fulfilled,
            network_status,
            data,
            error: None,
        }
    }

    /// What a reader under `policy` sees for this snapshot.
    ///
    /// `Err` is the error a read raises. Pending snapshots yield their
    /// current data; readers suspend on them before getting here.
    pub fn result_under(&self, policy: ErrorPolicy) -> Result<QueryResult, QueryError> {
        let classified = apply(policy, self.data.clone(), self.error.clone());
        match classified.throwable {
            Some(err) => Err(err),
            None => Ok(QueryResult {
                data: classified.data,
                error: classified.error,
                network_status: self.network_status,
            }),
        }
    }
}

/// What a successful read returns
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub network_status: NetworkStatus,
}

/// Outcome of a non-blocking read
#[derive(Debug)]
pub enum Read {
    Ready(QueryResult),
    /// The reference is pending; wait on the signal, then read again
    Suspend(PendingSignal),
}

/// Resolves when the reference it was taken from leaves the pending state.
///
/// All signals of one identity observe the same channel.
#[derive(Debug, Clone)]
pub struct PendingSignal {
    rx: watch::Receiver<RefSnapshot>,
}

impl PendingSignal {
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().status != QueryStatus::Pending
    }

    pub async fn resolved(mut self) {
        let _ = self
            .rx
            .wait_for(|s| s.status != QueryStatus::Pending)
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum UpdateMode {
    /// Flip to pending so active readers suspend
    Suspend(NetworkStatus),
    /// Keep the current snapshot visible until the result lands
    Quiet(NetworkStatus),
}

/// Which fetch a reference tracks, and which one it last applied
#[derive(Debug, Default)]
struct Generations {
    latest: u64,
    settled: u64,
}

pub(crate) type ReleaseHook = Arc<dyn Fn(Arc<RefEntry>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared state behind every holder of one identity.
///
/// Policy free: holders apply their own options when reading.
pub(crate) struct RefEntry {
    identity: Identity,
    state: watch::Sender<RefSnapshot>,
    generations: Mutex<Generations>,
    holders: AtomicUsize,
    disposed: AtomicBool,
    store_subscription: Mutex<Option<StoreSubscription>>,
    on_release: ReleaseHook,
}

impl RefEntry {
    pub(crate) fn new(
        identity: Identity,
        initial: RefSnapshot,
        on_release: ReleaseHook,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(initial);
        Arc::new(Self {
            identity,
            state,
            generations: Mutex::new(Generations::default()),
            holders: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            store_subscription: Mutex::new(None),
            on_release,
        })
    }

    /// Follow store writes for this identity
    pub(crate) fn watch_store(self: &Arc<Self>, store: &dyn QueryStore) {
        let weak = Arc::downgrade(self);
        let subscription = store.subscribe(
            &self.identity,
            Arc::new(move |data| {
                if let Some(entry) = weak.upgrade() {
                    entry.apply_store_change(data);
                }
            }),
        );
        *self
            .store_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> RefSnapshot {
        self.state.borrow().clone()
    }

    fn generations(&self) -> std::sync::MutexGuard<'_, Generations> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a fetch was started whose settlement has not been applied
    pub(crate) fn has_outstanding_fetch(&self) -> bool {
        let generations = self.generations();
        generations.latest != generations.settled
    }

    /// Add a holder reading under `options`
    pub(crate) fn retain(self: &Arc<Self>, options: QueryOptions) -> QueryRef {
        self.holders.fetch_add(1, Ordering::SeqCst);
        QueryRef {
            entry: Arc::clone(self),
            options,
            released: false,
        }
    }

    pub(crate) fn mark_disposed(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscription = self
            .store_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);
        trace!("Disposed reference for {}", self.identity);
    }

    async fn release(self: Arc<Self>) {
        let previous = self.holders.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            debug!("Last holder released {}", self.identity);
            let hook = Arc::clone(&self.on_release);
            hook(self).await;
        }
    }

    /// Track a new fetch; only its settlement is applied from now on
    pub(crate) fn begin_fetch(self: &Arc<Self>, handle: FetchHandle, mode: UpdateMode) {
        let generation = handle.generation();
        {
            let mut generations = self.generations();
            generations.latest = generation;
            self.state.send_modify(|s| match mode {
                UpdateMode::Suspend(network_status) => {
                    s.status = QueryStatus::Pending;
                    s.network_status = network_status;
                }
                UpdateMode::Quiet(network_status) => s.network_status = network_status,
            });
        }

        let entry = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = handle.settled().await;
            entry.settle(generation, outcome);
        });
    }

    /// Apply a settled fetch. Results of superseded fetches are discarded;
    /// applying the same fetch twice is a no-op.
    pub(crate) fn settle(&self, generation: u64, outcome: FetchOutcome) {
        let mut generations = self.generations();
        if generation != generations.latest {
            debug!(
                "Discarding superseded result of fetch {} for {}",
                generation, self.identity
            );
            return;
        }
        if generations.settled == generation {
            return;
        }

        let failed = is_failure(&outcome);
        let (data, error) = outcome_parts(&outcome);
        generations.settled = generation;
        self.state.send_modify(|s| {
            if failed {
                s.status = QueryStatus::Rejected;
                s.network_status = NetworkStatus::Error;
            } else {
                s.status = QueryStatus::Fulfilled;
                s.network_status = NetworkStatus::Ready;
            }
            s.data = data;
            s.error = error;
        });
        drop(generations);
        debug!(
            "Fetch {} settled {} ({})",
            generation,
            self.identity,
            if failed { "rejected" } else { "fulfilled" }
        );
    }

    fn apply_store_change(&self, data: Arc<Value>) {
        let generations = self.generations();
        if self.is_disposed() || generations.latest != generations.settled {
            trace!("Ignoring store change for {} while a fetch is outstanding", self.identity);
            return;
        }
        // Rejected references take the data too; their error stays
        let changed = self.state.send_if_modified(|s| {
            if s.status == QueryStatus::Pending || s.data.as_deref() == Some(&*data) {
                return false;
            }
            s.data = Some(data);
            true
        });
        if changed {
            debug!("Applied store change to {}", self.identity);
        }
    }
}

/// One holder's handle on a shared query reference.
///
/// Holders of one identity share state but not options: each reads under
/// the error policy of the request that obtained it.
///
/// Not `Clone`: use [`retain`](QueryRef::retain) to add a holder. Dropping a
/// handle without [`dispose`](QueryRef::dispose) releases it on the runtime.
pub struct QueryRef {
    entry: Arc<RefEntry>,
    options: QueryOptions,
    released: bool,
}

impl QueryRef {
    pub fn identity(&self) -> &Identity {
        self.entry.identity()
    }

    /// Options of the request this handle was obtained for
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn status(&self) -> QueryStatus {
        self.entry.state.borrow().status
    }

    pub fn snapshot(&self) -> RefSnapshot {
        self.entry.snapshot()
    }

    /// Number of holders across all handles of this reference
    pub fn holders(&self) -> usize {
        self.entry.holders()
    }

    /// Whether two handles share one underlying reference
    pub fn same_reference(&self, other: &QueryRef) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// Read without blocking.
    ///
    /// Pending references return a signal to suspend on. Rejected references
    /// return the error when this holder's error policy throws.
    pub fn read(&self) -> Result<Read, QueryError> {
        if self.entry.is_disposed() {
            return Err(QueryError::Disposed(self.identity().to_string()));
        }
        let snapshot = self.entry.snapshot();
        match snapshot.status {
            QueryStatus::Pending => Ok(Read::Suspend(PendingSignal {
                rx: self.entry.state.subscribe(),
            })),
            QueryStatus::Fulfilled | QueryStatus::Rejected => snapshot
                .result_under(self.options.error_policy)
                .map(Read::Ready),
        }
    }

    /// Change stream of this reference's snapshots
    pub fn watch(&self) -> watch::Receiver<RefSnapshot> {
        self.entry.state.subscribe()
    }

    /// Wait until the reference is no longer pending, then read
    pub async fn settled(&self) -> Result<QueryResult, QueryError> {
        loop {
            match self.read()? {
                Read::Ready(result) => return Ok(result),
                Read::Suspend(signal) => signal.resolved().await,
            }
        }
    }

    /// Add a holder with the same options
    pub fn retain(&self) -> QueryRef {
        self.entry.retain(self.options.clone())
    }

    /// Remove this holder; the last one tears the reference down
    pub async fn dispose(mut self) {
        self.released = true;
        Arc::clone(&self.entry).release().await;
    }

    pub(crate) fn entry(&self) -> &Arc<RefEntry> {
        &self.entry
    }
}

impl Drop for QueryRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let entry = Arc::clone(&self.entry);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(entry.release());
            }
            Err(_) => warn!(
                "QueryRef for {} dropped outside a runtime; holder not released",
                entry.identity
            ),
        }
    }
}

impl fmt::Debug for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef")
            .field("identity", self.identity())
            .field("status", &self.status())
            .field("holders", &self.holders())
            .finish()
    }
}
