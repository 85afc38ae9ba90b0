//! Counter store abstraction and backend selection.
//!
//! The rate limiter keeps all of its state in a [`CounterStore`]. Two
//! implementations exist: [`RedisStore`], shared by every process pointed at
//! the same Redis, and [`MemoryStore`], local to this process. The backend is
//! chosen exactly once by [`connect`] and never re-evaluated afterwards.

mod distributed;
mod memory;
mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StoreConfig;

pub use distributed::RedisStore;
pub use memory::{MemoryStore, DEFAULT_MAX_ENTRIES};
pub use state::{BucketLevel, BucketSpec, WindowLog, TOKEN_EPSILON};

/// Errors reported by counter store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected the operation or the connection failed.
    #[error("backend failure: {0}")]
    Backend(String),

    /// The operation did not complete within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored or returned value could not be decoded.
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Which implementation backs a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Networked Redis instance
    Redis,
    /// In-process map
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Key-value store with expiry and atomic counters.
///
/// Values are opaque strings. An expired entry is never returned: every
/// implementation treats it exactly like an absent key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value, for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `amount` to the integer at `key` and refresh its expiry.
    ///
    /// An absent key counts as zero. Concurrent increments are never lost.
    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Whether a live entry exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically trim the timestamp log at `key` to the last `window`
    /// seconds and append `now` if fewer than `limit` timestamps remain.
    ///
    /// The log expires `window` seconds after the last append.
    async fn append_within_window(
        &self,
        key: &str,
        now: u64,
        window: u64,
        limit: u64,
    ) -> Result<WindowLog, StoreError>;

    /// Atomically refill the token bucket at `key` up to `now_ms` (Unix
    /// milliseconds) and take one token if a whole one is available.
    async fn take_token(
        &self,
        key: &str,
        now_ms: u64,
        shape: &BucketSpec,
    ) -> Result<BucketLevel, StoreError>;

    /// Remove every entry. Intended for tests and administration.
    async fn clear(&self) -> Result<(), StoreError>;

    /// The implementation behind this store.
    fn backend(&self) -> StoreBackend;
}

/// Select and initialize the counter store.
///
/// Redis is used when a URL is configured and answers a ping within the
/// connect timeout. Otherwise the in-process store is used and its expiry
/// sweep is started.
pub async fn connect(config: &StoreConfig) -> Arc<dyn CounterStore> {
    if let Some(url) = config.redis_url.as_deref() {
        match RedisStore::connect(url, config.connect_timeout(), config.operation_timeout()).await {
            Ok(store) => {
                info!(backend = %StoreBackend::Redis, "Counter store initialized");
                return Arc::new(store);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Redis unavailable at startup, falling back to in-process counter store"
                );
            }
        }
    }

    let store = Arc::new(MemoryStore::new(config.max_entries));
    store.spawn_sweeper(config.sweep_interval());
    info!(
        backend = %StoreBackend::Memory,
        max_entries = config.max_entries,
        sweep_interval_secs = config.sweep_interval_secs,
        "Counter store initialized"
    );
    store
}
