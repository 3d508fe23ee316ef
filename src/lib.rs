//! pquery - Suspension-aware query coordination
//!
//! This library coordinates reads of named, parameterized queries for
//! clients that render while fetches are in flight:
//! - Canonical identities from (query, variables, disambiguation key)
//! - At most one in-flight fetch per identity, shared by every requester
//! - Shared query references readers suspend on until their fetch settles
//! - Background initiation that never suspends the caller
//! - Refetch and pagination that update references in place, quietly
//!   inside a transition
//! - Per-request error policies
//!
//! The store, transport and suspension capability are collaborators behind
//! traits; an in-memory store is included.

mod client;
mod config;
mod error;
pub mod error_policy;
mod identity;
mod preload;
mod refetch;
mod reference;
pub mod registry;
pub mod store;
pub mod suspense;
pub mod transition;
pub mod transport;

pub use client::{QueryClient, QueryClientBuilder, QueryRead};
pub use config::{ClientConfig, ErrorPolicy, FetchPolicy, QueryOptions};
pub use error::{BoxError, QueryError};
pub use identity::{
    Identity, IdentityDeriver, NoopSanitizer, QueryDescriptor, StripFields, VariableSanitizer,
};
pub use refetch::MergeFn;
pub use reference::{
    NetworkStatus, PendingSignal, QueryRef, QueryResult, QueryStatus, Read, RefSnapshot,
};
pub use store::{CacheStatus, MemoryStore, QueryStore};
pub use transport::{FetchResponse, ResponseError, Transport};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
