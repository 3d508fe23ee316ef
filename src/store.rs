//! Store collaborator
//!
//! The coordination core consults a [`QueryStore`] before deciding whether
//! to fetch, writes settled results back, and listens for changes so that
//! references update when other writers touch the same identity.
//!
//! [`MemoryStore`] is an in-memory implementation on a Moka cache. It knows
//! nothing about normalization: an identity maps to one JSON object, and the
//! query's declared top-level fields decide between a hit and partial data.

use moka::future::Cache;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, trace};

use crate::{ClientConfig, Identity};

/// Completeness of the stored result for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// All requested fields present
    Hit,
    /// Some requested fields present
    Partial,
    /// Nothing usable stored
    Miss,
}

#[derive(Debug, Clone)]
pub struct StoreRead {
    pub status: CacheStatus,
    pub data: Option<Arc<Value>>,
}

impl StoreRead {
    pub fn miss() -> Self {
        Self {
            status: CacheStatus::Miss,
            data: None,
        }
    }
}

/// Invoked with the new stored value for a watched identity
pub type ChangeCallback = Arc<dyn Fn(Arc<Value>) + Send + Sync + 'static>;

/// Disposer for a store change subscription; unsubscribes on drop
pub struct StoreSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl StoreSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to undo
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Result store consulted by the coordination core
#[async_trait::async_trait]
pub trait QueryStore: Send + Sync + 'static {
    async fn read(&self, identity: &Identity) -> StoreRead;

    async fn write(&self, identity: &Identity, data: Arc<Value>);

    fn subscribe(&self, identity: &Identity, on_change: ChangeCallback) -> StoreSubscription;
}

type Listeners = HashMap<Identity, Vec<(u64, ChangeCallback)>>;

/// In-memory store backed by a Moka cache
pub struct MemoryStore {
    entries: Cache<Identity, Arc<Value>>,
    listeners: Arc<Mutex<Listeners>>,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: &ClientConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.store_max_capacity)
            .time_to_live(config.store_ttl)
            .build();

        Self {
            entries,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Drop the stored result for an identity. Listeners are not notified.
    pub async fn evict(&self, identity: &Identity) {
        debug!("Evicting stored result for {}", identity);
        self.entries.invalidate(identity).await;
    }

    pub fn listener_count(&self, identity: &Identity) -> usize {
        lock(&self.listeners).get(identity).map_or(0, Vec::len)
    }

    fn notify(&self, identity: &Identity, data: &Arc<Value>) {
        // Call outside the lock so listeners may (un)subscribe
        let callbacks: Vec<ChangeCallback> = lock(&self.listeners)
            .get(identity)
            .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        trace!("Notifying {} listeners of {}", callbacks.len(), identity);
        for cb in callbacks {
            cb(Arc::clone(data));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}

fn lock(listeners: &Mutex<Listeners>) -> std::sync::MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

fn completeness(identity: &Identity, data: &Value) -> CacheStatus {
    let fields = identity.query().fields();
    if fields.is_empty() {
        return CacheStatus::Hit;
    }
    let Some(object) = data.as_object() else {
        return CacheStatus::Miss;
    };

    let present = fields
        .iter()
        .filter(|f| object.contains_key(f.as_str()))
        .count();
    if present == fields.len() {
        CacheStatus::Hit
    } else if present == 0 {
        CacheStatus::Miss
    } else {
        CacheStatus::Partial
    }
}

#[async_trait::async_trait]
impl QueryStore for MemoryStore {
    async fn read(&self, identity: &Identity) -> StoreRead {
        let Some(data) = self.entries.get(identity).await else {
            debug!("Store miss for {}", identity);
            return StoreRead::miss();
        };

        let status = completeness(identity, &data);
        debug!("Store {:?} for {}", status, identity);
        StoreRead {
            status,
            data: (status != CacheStatus::Miss).then_some(data),
        }
    }

    async fn write(&self, identity: &Identity, data: Arc<Value>) {
        // Shallow merge: incoming top-level fields replace stored ones
        let merged = match (self.entries.get(identity).await, data.as_object()) {
            (Some(existing), Some(incoming)) if existing.is_object() => {
                let mut object = existing.as_object().cloned().unwrap_or_default();
                for (k, v) in incoming {
                    object.insert(k.clone(), v.clone());
                }
                Arc::new(Value::Object(object))
            }
            _ => data,
        };

        self.entries
            .insert(identity.clone(), Arc::clone(&merged))
            .await;
        debug!("Stored result for {}", identity);
        self.notify(identity, &merged);
    }

    fn subscribe(&self, identity: &Identity, on_change: ChangeCallback) -> StoreSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners)
            .entry(identity.clone())
            .or_default()
            .push((id, on_change));

        let listeners = Arc::clone(&self.listeners);
        let identity = identity.clone();
        StoreSubscription::new(move || {
            let mut listeners = lock(&listeners);
            if let Some(list) = listeners.get_mut(&identity) {
                list.retain(|(i, _)| *i != id);
                if list.is_empty() {
                    listeners.remove(&identity);
                }
            }
        })
    }
}
