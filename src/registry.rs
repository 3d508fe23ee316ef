//! In-flight fetch registry
//!
//! Tracks the single outstanding network operation per [`Identity`] so that
//! concurrent requests coalesce instead of fetching in parallel. Entries
//! live until their operation settles; releasing every subscriber never
//! evicts a pending entry, so a fast resubscribe reuses the running fetch.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, watch};
use tracing::{debug, trace, warn};

use crate::{Identity, QueryError, transport::FetchOutcome};

type OutcomeReceiver = watch::Receiver<Option<FetchOutcome>>;
type OutcomeSender = watch::Sender<Option<FetchOutcome>>;

/// Shared view of one network operation
#[derive(Debug, Clone)]
pub struct FetchHandle {
    generation: u64,
    rx: OutcomeReceiver,
}

impl FetchHandle {
    /// Monotonic id of the operation; later operations have larger ids
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the operation to settle
    pub async fn settled(&self) -> FetchOutcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if rx.changed().await.is_err() {
                // Sender dropped without sending
                return Err(QueryError::Cancelled);
            }
        }
    }
}

struct InFlightEntry {
    handle: FetchHandle,
    subscribers: usize,
}

/// Process-wide (per client) map from identity to its outstanding fetch
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    entries: Arc<RwLock<HashMap<Identity, InFlightEntry>>>,
    generations: Arc<AtomicU64>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding fetch for `identity`, or start one.
    ///
    /// `start_fetch` runs only when no entry exists. It receives the guard it
    /// must complete once the operation settles.
    pub async fn acquire<F>(&self, identity: &Identity, start_fetch: F) -> FetchHandle
    where
        F: FnOnce(InFlightGuard),
    {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(identity) {
            entry.subscribers += 1;
            debug!(
                "Joining in-flight fetch for {} ({} subscribers)",
                identity, entry.subscribers
            );
            return entry.handle.clone();
        }

        let (guard, handle) = self.register(&mut entries, identity, 1);
        drop(entries);

        debug!("Starting fetch {} for {}", handle.generation, identity);
        start_fetch(guard);
        handle
    }

    /// Start a new fetch for `identity` even if one is outstanding.
    ///
    /// The previous operation keeps running; its settlement no longer touches
    /// the registry, and consumers tracking generations discard it.
    pub async fn supersede<F>(&self, identity: &Identity, start_fetch: F) -> FetchHandle
    where
        F: FnOnce(InFlightGuard),
    {
        let mut entries = self.entries.write().await;
        let subscribers = match entries.get(identity) {
            Some(previous) => {
                debug!(
                    "Superseding fetch {} for {}",
                    previous.handle.generation, identity
                );
                previous.subscribers.max(1)
            }
            None => 1,
        };

        let (guard, handle) = self.register(&mut entries, identity, subscribers);
        drop(entries);

        debug!("Starting fetch {} for {}", handle.generation, identity);
        start_fetch(guard);
        handle
    }

    /// Drop one subscriber. Pending entries are kept regardless.
    pub async fn release(&self, identity: &Identity) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(identity) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                debug!(
                    "All subscribers released {}; fetch {} runs to completion",
                    identity, entry.handle.generation
                );
            }
        }
    }

    pub async fn contains(&self, identity: &Identity) -> bool {
        self.entries.read().await.contains_key(identity)
    }

    pub async fn subscriber_count(&self, identity: &Identity) -> Option<usize> {
        self.entries.read().await.get(identity).map(|e| e.subscribers)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn register(
        &self,
        entries: &mut HashMap<Identity, InFlightEntry>,
        identity: &Identity,
        subscribers: usize,
    ) -> (InFlightGuard, FetchHandle) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(None);
        let handle = FetchHandle { generation, rx };
        entries.insert(
            identity.clone(),
            InFlightEntry {
                handle: handle.clone(),
                subscribers,
            },
        );
        (
            InFlightGuard {
                identity: identity.clone(),
                generation,
                registry: self.clone(),
                tx: Some(tx),
            },
            handle,
        )
    }

    fn remove_current(
        entries: &mut HashMap<Identity, InFlightEntry>,
        identity: &Identity,
        generation: u64,
    ) {
        if entries
            .get(identity)
            .is_some_and(|e| e.handle.generation == generation)
        {
            entries.remove(identity);
            trace!("Removed settled fetch {} for {}", generation, identity);
        }
    }

    async fn settle(&self, identity: &Identity, generation: u64) {
        let mut entries = self.entries.write().await;
        Self::remove_current(&mut entries, identity, generation);
    }
}

/// Completion side of a registered fetch.
///
/// Dropping the guard without completing it (panic, cancelled task) settles
/// the operation with [`QueryError::Cancelled`] and still cleans up the entry.
pub struct InFlightGuard {
    identity: Identity,
    generation: u64,
    registry: InFlightRegistry,
    tx: Option<OutcomeSender>,
}

impl InFlightGuard {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this operation is still the registered one for its identity
    pub async fn is_current(&self) -> bool {
        self.registry
            .entries
            .read()
            .await
            .get(&self.identity)
            .is_some_and(|e| e.handle.generation == self.generation)
    }

    /// Settle the operation: remove the entry, then wake every subscriber.
    pub async fn complete(mut self, outcome: FetchOutcome) {
        self.registry.settle(&self.identity, self.generation).await;
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        warn!(
            "Fetch {} for {} was dropped before completing",
            self.generation, self.identity
        );

        match self.registry.entries.try_write() {
            Ok(mut entries) => {
                InFlightRegistry::remove_current(&mut entries, &self.identity, self.generation);
            }
            Err(_) => {
                let registry = self.registry.clone();
                let identity = self.identity.clone();
                let generation = self.generation;
                match tokio::runtime::Handle::try_current() {
                    Ok(rt) => {
                        rt.spawn(async move {
                            registry.settle(&identity, generation).await;
                        });
                    }
                    Err(_) => warn!(
                        "No runtime to clean up fetch {} for {}",
                        generation, self.identity
                    ),
                }
            }
        }

        tx.send_replace(Some(Err(QueryError::Cancelled)));
    }
}
