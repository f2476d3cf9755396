//! Stale-while-revalidate fetch cache with request coalescing.
//!
//! Reads are routed by the freshness of the existing entry:
//!
//! - no entry or `Expired`: the caller waits for a fetch
//! - `Stale`: the cached value is returned at once and a background
//!   revalidation starts unless one is already running
//! - `Fresh`: the cached value is returned, no remote call
//!
//! At most one fetch per key is in flight at any time. Every caller that
//! asks for a key while its fetch is running receives that fetch's outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use chatline_core::{Clock, ConfigError, FetchError, SystemClock, Timestamp};

use crate::entry::CacheEntry;
use crate::freshness::{CacheRead, Freshness, FreshnessPolicy};
use crate::key::CacheKey;
use crate::persistence::PersistenceAdapter;
use crate::stats::CacheStats;

/// Values the cache can hold and persist.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Configuration for the fetch cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Time an entry stays fresh.
    pub max_age_ms: u64,
    /// Extra time a stale entry remains servable while revalidating.
    pub stale_while_revalidate_ms: u64,
    /// Eviction threshold.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 5 * 60 * 1000,                 // 5 minutes
            stale_while_revalidate_ms: 30 * 60 * 1000, // 30 minutes
            max_entries: 100,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fresh window.
    pub fn with_max_age(mut self, duration: Duration) -> Self {
        self.max_age_ms = millis(duration);
        self
    }

    /// Set the stale-while-revalidate window.
    pub fn with_stale_while_revalidate(mut self, duration: Duration) -> Self {
        self.stale_while_revalidate_ms = millis(duration);
        self
    }

    /// Set the eviction threshold.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// How long an entry is served as fresh.
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// How long past `max_age` a stale entry is still served while it refreshes.
    pub fn stale_while_revalidate(&self) -> Duration {
        Duration::from_millis(self.stale_while_revalidate_ms)
    }

    /// The freshness windows as a classifying policy.
    pub fn policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.max_age(), self.stale_while_revalidate())
    }

    /// Reject a zero entry bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "must be > 0"));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

type InFlight<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CacheInner<T> {
    config: CacheConfig,
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<CacheKey, CacheEntry<T>>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight<T>>>,
    persistence: Option<PersistenceAdapter>,
    /// Serializes snapshot-and-write so an older snapshot never lands last.
    persist_lock: tokio::sync::Mutex<()>,
    stats: Mutex<CacheStats>,
}

/// Removes the in-flight marker when the fetch task ends, including on panic.
struct InFlightGuard<T: CacheValue> {
    inner: Arc<CacheInner<T>>,
    key: CacheKey,
}

impl<T: CacheValue> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.key);
    }
}

impl<T: CacheValue> CacheInner<T> {
    /// Join the fetch in flight for `key`, or start one.
    ///
    /// The check and the insert happen under one lock with no suspension
    /// point between them. Returns whether a new fetch was started.
    fn join_or_start<F, Fut, E>(self: &Arc<Self>, key: &CacheKey, fetcher: F) -> (InFlight<T>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let mut in_flight = lock(&self.in_flight);
        if let Some(existing) = in_flight.get(key) {
            return (existing.clone(), false);
        }

        let guard = InFlightGuard {
            inner: Arc::clone(self),
            key: key.clone(),
        };
        let handle = tokio::spawn(async move {
            let outcome = fetcher().await.map_err(Into::into);
            let settled = guard.inner.settle(&guard.key, outcome).await;
            drop(guard);
            settled
        });

        let shared = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(FetchError::Aborted {
                    reason: err.to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key.clone(), shared.clone());
        (shared, true)
    }

    /// Store a successful outcome; leave existing entries alone on failure.
    async fn settle(&self, key: &CacheKey, outcome: Result<T, FetchError>) -> Result<T, FetchError> {
        match outcome {
            Ok(value) => {
                let now = self.clock.now();
                let entry = CacheEntry::new(key.clone(), value.clone(), now, &self.policy);
                let evicted = {
                    let mut entries = lock(&self.entries);
                    entries.insert(key.clone(), entry);
                    self.prune_locked(&mut entries, now)
                };
                if evicted > 0 {
                    debug!(key = %key, evicted, "Pruned cache after store");
                }
                trace!(key = %key, "Stored fetched value");
                self.persist().await;
                Ok(value)
            }
            Err(err) => {
                lock(&self.stats).fetch_failures += 1;
                warn!(key = %key, error = %err, "Fetch failed; existing entry left untouched");
                Err(err)
            }
        }
    }

    /// Drop expired entries, then evict the oldest by `created_at` until the
    /// entry count is within `max_entries`. Returns the number evicted for
    /// capacity.
    fn prune_locked(&self, entries: &mut HashMap<CacheKey, CacheEntry<T>>, now: Timestamp) -> usize {
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = evict_oldest(entries, self.config.max_entries);
        let mut stats = lock(&self.stats);
        stats.evictions += evicted as u64;
        stats.entry_count = entries.len() as u64;
        evicted
    }

    /// Entries ordered by creation time, oldest first.
    fn snapshot(&self) -> Vec<(CacheKey, CacheEntry<T>)> {
        let entries = lock(&self.entries);
        let mut records: Vec<(CacheKey, CacheEntry<T>)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        records.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then_with(|| a.0.cmp(&b.0)));
        records
    }

    async fn persist(&self) {
        let Some(adapter) = &self.persistence else {
            return;
        };
        let _serialized = self.persist_lock.lock().await;
        let records = self.snapshot();
        if let Err(err) = adapter.save(&records).await {
            warn!(
                storage_key = adapter.storage_key(),
                error = %err,
                "Failed to persist cache; continuing in memory"
            );
        }
    }
}

/// Remove the oldest entries until at most `max` remain.
fn evict_oldest<T>(entries: &mut HashMap<CacheKey, CacheEntry<T>>, max: usize) -> usize {
    if entries.len() <= max {
        return 0;
    }
    let mut by_age: Vec<(Timestamp, CacheKey)> = entries
        .iter()
        .map(|(key, entry)| (entry.created_at, key.clone()))
        .collect();
    by_age.sort();
    let excess = entries.len() - max;
    for (_, key) in by_age.into_iter().take(excess) {
        entries.remove(&key);
    }
    excess
}

/// Resilient fetch cache.
///
/// Cloning is cheap; clones share entries, in-flight fetches, and stats.
/// The cache is meant to be constructed once by the application shell and
/// handed to whichever components need it.
///
/// # Example
///
/// ```ignore
/// let cache = FetchCache::builder(config)
///     .persistence(PersistenceAdapter::with_default_key(store))
///     .restore()
///     .await;
///
/// let read = cache.get(&key, move || rest.get_json(path)).await?;
/// ```
pub struct FetchCache<T: CacheValue> {
    inner: Arc<CacheInner<T>>,
}

impl<T: CacheValue> Clone for FetchCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CacheValue> std::fmt::Debug for FetchCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// Builder for a [`FetchCache`] with a custom clock or persistence.
pub struct FetchCacheBuilder<T: CacheValue> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    persistence: Option<PersistenceAdapter>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: CacheValue> FetchCacheBuilder<T> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn persistence(mut self, adapter: PersistenceAdapter) -> Self {
        self.persistence = Some(adapter);
        self
    }

    /// Build an empty cache without reading persisted state.
    pub fn build(self) -> FetchCache<T> {
        FetchCache {
            inner: Arc::new(CacheInner {
                policy: self.config.policy(),
                config: self.config,
                clock: self.clock,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                persistence: self.persistence,
                persist_lock: tokio::sync::Mutex::new(()),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    /// Build the cache and populate it from persisted state.
    ///
    /// Entries already past `stale_until` are discarded; unreadable state
    /// is treated as empty.
    pub async fn restore(self) -> FetchCache<T> {
        let cache = self.build();
        if let Some(adapter) = &cache.inner.persistence {
            let now = cache.inner.clock.now();
            let records = adapter.load::<T>(now).await;
            let restored = records.len();
            let mut entries = lock(&cache.inner.entries);
            entries.extend(records);
            cache.inner.prune_locked(&mut entries, now);
            debug!(restored, kept = entries.len(), "Restored cache from persistence");
        }
        cache
    }
}

impl<T: CacheValue> FetchCache<T> {
    /// In-memory cache on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    /// In-memory cache on the given clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::builder(config).clock(clock).build()
    }

    pub fn builder(config: CacheConfig) -> FetchCacheBuilder<T> {
        FetchCacheBuilder {
            config,
            clock: Arc::new(SystemClock),
            persistence: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Read `key`, fetching through `fetcher` when needed.
    ///
    /// Errors from a background revalidation are logged and never reach
    /// this caller.
    pub async fn get<F, Fut, E>(&self, key: &CacheKey, fetcher: F) -> Result<CacheRead<T>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let cached = lock(&self.inner.entries).get(key).map(|entry| {
            (entry.value.clone(), entry.created_at, entry.freshness(now))
        });

        match cached {
            Some((value, cached_at, Freshness::Fresh)) => {
                lock(&self.inner.stats).hits += 1;
                trace!(key = %key, "Fresh cache hit");
                Ok(CacheRead::from_cache(value, cached_at, Freshness::Fresh))
            }
            Some((value, cached_at, Freshness::Stale)) => {
                let (_, started) = self.inner.join_or_start(key, fetcher);
                {
                    let mut stats = lock(&self.inner.stats);
                    stats.stale_hits += 1;
                    if started {
                        stats.background_refreshes += 1;
                    }
                }
                debug!(key = %key, revalidating = started, "Stale cache hit");
                Ok(CacheRead::from_cache(value, cached_at, Freshness::Stale))
            }
            _ => {
                lock(&self.inner.stats).misses += 1;
                debug!(key = %key, "Cache miss");
                let value = self.fetch_and_store(key, fetcher).await?;
                Ok(CacheRead::from_fetch(value, self.inner.clock.now()))
            }
        }
    }

    /// Fetch `key` and store the result, joining a fetch already in flight.
    pub async fn fetch_and_store<F, Fut, E>(&self, key: &CacheKey, fetcher: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let (pending, started) = self.inner.join_or_start(key, fetcher);
        if !started {
            lock(&self.inner.stats).coalesced += 1;
            trace!(key = %key, "Joined in-flight fetch");
        }
        pending.await
    }

    /// Store a value directly, as if it had just been fetched.
    pub async fn set(&self, key: &CacheKey, value: T) {
        let _ = self.inner.settle(key, Ok(value)).await;
    }

    /// Current entry for `key` without fetching or touching statistics.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheRead<T>> {
        let now = self.inner.clock.now();
        lock(&self.inner.entries)
            .get(key)
            .map(|entry| CacheRead::from_cache(entry.value.clone(), entry.created_at, entry.freshness(now)))
    }

    /// Remove the entry for `key`. Does not cancel a fetch in flight.
    ///
    /// Returns whether an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = lock(&self.inner.entries).remove(key).is_some();
        if removed {
            debug!(key = %key, "Invalidated cache entry");
            self.after_removal();
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut entries = lock(&self.inner.entries);
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            before - entries.len()
        };
        if removed > 0 {
            debug!(prefix, removed, "Invalidated cache entries by prefix");
            self.after_removal();
        }
        removed
    }

    /// Remove all entries and the persisted state.
    pub async fn clear(&self) {
        lock(&self.inner.entries).clear();
        lock(&self.inner.stats).entry_count = 0;
        if let Some(adapter) = &self.inner.persistence {
            let _serialized = self.inner.persist_lock.lock().await;
            if let Err(err) = adapter.clear().await {
                warn!(
                    storage_key = adapter.storage_key(),
                    error = %err,
                    "Failed to clear persisted cache"
                );
            }
        }
    }

    /// Drop expired entries and enforce capacity.
    ///
    /// Returns the number of entries removed for any reason.
    pub fn prune(&self) -> usize {
        let now = self.inner.clock.now();
        let removed = {
            let mut entries = lock(&self.inner.entries);
            let before = entries.len();
            self.inner.prune_locked(&mut entries, now);
            before - entries.len()
        };
        if removed > 0 {
            self.after_removal();
        }
        removed
    }

    /// Number of cached entries, whatever their freshness.
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` has an entry, expired or not.
    pub fn contains(&self, key: &CacheKey) -> bool {
        lock(&self.inner.entries).contains_key(key)
    }

    /// Keys currently cached, oldest first.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.snapshot().into_iter().map(|(key, _)| key).collect()
    }

    /// Number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Whether a fetch for `key` is running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.inner.in_flight).contains_key(key)
    }

    /// Counters so far, with the current entry count.
    pub fn stats(&self) -> CacheStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.entry_count = self.len() as u64;
        stats
    }

    /// Persist after a removal when a runtime is available to do it on.
    fn after_removal(&self) {
        let count = self.len() as u64;
        lock(&self.inner.stats).entry_count = count;
        if self.inner.persistence.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move { inner.persist().await });
            }
            Err(_) => {
                debug!("No runtime available; removal will be persisted with the next store");
            }
        }
    }
}
