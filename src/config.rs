//! Client and per-request configuration

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// How a request uses the store before (or instead of) the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Serve a store hit, fetch otherwise
    #[default]
    CacheFirst,
    /// Serve a store hit and refresh it from the network
    CacheAndNetwork,
    /// Always fetch; results are written to the store
    NetworkOnly,
    /// Always fetch; results bypass the store
    NoCache,
    /// Never fetch
    CacheOnly,
    /// Never fetch until explicitly refetched
    Standby,
}

impl FetchPolicy {
    /// Whether a request under this policy is guaranteed to settle.
    ///
    /// Suspending reads and background initiation need an eventual
    /// resolution signal, so they reject policies that never fetch.
    pub fn can_settle(self) -> bool {
        !matches!(self, FetchPolicy::CacheOnly | FetchPolicy::Standby)
    }

    /// Whether a request under this policy goes to the network even when a
    /// settled result is already at hand
    pub fn requires_network(self) -> bool {
        matches!(
            self,
            FetchPolicy::CacheAndNetwork | FetchPolicy::NetworkOnly | FetchPolicy::NoCache
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchPolicy::CacheFirst => "cache-first",
            FetchPolicy::CacheAndNetwork => "cache-and-network",
            FetchPolicy::NetworkOnly => "network-only",
            FetchPolicy::NoCache => "no-cache",
            FetchPolicy::CacheOnly => "cache-only",
            FetchPolicy::Standby => "standby",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How errors in a fetch outcome surface to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// First error rejects the read
    #[default]
    None,
    /// Errors surface next to (partial) data without rejecting
    All,
    /// Errors are discarded, only data surfaces
    Ignore,
}

/// Options attached to a single request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub fetch_policy: FetchPolicy,
    pub error_policy: ErrorPolicy,
    /// Serve partial store data immediately while the missing fields are fetched
    pub return_partial_data: bool,
    /// Lets otherwise identical requests coexist as independent identities
    pub disambiguation_key: Option<String>,
    /// Bypass all fetch and registry activity
    pub skip: bool,
}

impl QueryOptions {
    pub fn with_fetch_policy(mut self, fetch_policy: FetchPolicy) -> Self {
        self.fetch_policy = fetch_policy;
        self
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn with_partial_data(mut self, return_partial_data: bool) -> Self {
        self.return_partial_data = return_partial_data;
        self
    }

    pub fn with_disambiguation_key(mut self, key: impl Into<String>) -> Self {
        self.disambiguation_key = Some(key.into());
        self
    }

    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }
}

/// Configuration for a [`QueryClient`](crate::QueryClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of results kept by the default in-memory store
    pub store_max_capacity: u64,
    /// Time-to-live for results in the default in-memory store
    pub store_ttl: Duration,
    /// Options used by callers that do not build their own
    pub default_options: QueryOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_max_capacity: 1000,
            store_ttl: Duration::from_secs(300), // 5 minutes
            default_options: QueryOptions::default(),
        }
    }
}
