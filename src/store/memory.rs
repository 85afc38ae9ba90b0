//! In-process counter store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::state::{self, BucketLevel, BucketSpec, WindowLog};
use super::{CounterStore, StoreBackend, StoreError};

/// Default upper bound on the number of entries held in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: String, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A bounded key table with per-entry expiry.
///
/// All operations run under a single mutex, which also makes `increment`,
/// `append_within_window` and `take_token` atomic. Reads check expiry themselves;
/// the background sweep only reclaims memory.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Start the periodic expiry sweep.
    ///
    /// The task holds a weak reference and stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(sweep_loop(store, every))
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn insert(&self, entries: &mut HashMap<String, Entry>, key: &str, entry: Entry, now: Instant) {
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.is_live(now));

            if entries.len() >= self.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    debug!(key = %victim, "Counter store full, evicting entry closest to expiry");
                    entries.remove(&victim);
                }
            }
        }

        entries.insert(key.to_string(), entry);
    }
}

/// Look up a live entry, dropping it if it has expired.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        trace!(key = %key, "Dropping expired entry on read");
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

async fn sweep_loop(store: Weak<MemoryStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            break;
        };
        let removed = store.purge_expired();
        if removed > 0 {
            debug!(removed, remaining = store.len(), "Swept expired counter entries");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.insert(&mut entries, key, Entry::new(value.to_string(), now, ttl), now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // A non-integer value restarts the counter instead of failing the caller.
        let current = live(&mut entries, key, now)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current.saturating_add(amount);

        self.insert(&mut entries, key, Entry::new(next.to_string(), now, ttl), now);
        Ok(next)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live(&mut entries, key, now).is_some())
    }

    async fn append_within_window(
        &self,
        key: &str,
        now: u64,
        window: u64,
        limit: u64,
    ) -> Result<WindowLog, StoreError> {
        let instant = Instant::now();
        let mut entries = self.entries.lock();

        let raw = live(&mut entries, key, instant).map(|e| e.value.as_str());
        let (log, appended) = state::append_timestamp(raw, now, window, limit);
        if let Some(value) = appended {
            let entry = Entry::new(value, instant, Duration::from_secs(window));
            self.insert(&mut entries, key, entry, instant);
        }
        Ok(log)
    }

    async fn take_token(
        &self,
        key: &str,
        now_ms: u64,
        shape: &BucketSpec,
    ) -> Result<BucketLevel, StoreError> {
        let instant = Instant::now();
        let mut entries = self.entries.lock();

        let raw = live(&mut entries, key, instant).map(|e| e.value.as_str());
        let (level, taken) = state::take_token(raw, now_ms, shape);
        if let Some(value) = taken {
            self.insert(&mut entries, key, Entry::new(value, instant, shape.ttl), instant);
        }
        Ok(level)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }
}
