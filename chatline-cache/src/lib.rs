//! Resilient fetch cache for the chatline client data layer.
//!
//! This crate provides a request-result cache with stale-while-revalidate
//! semantics, at most one in-flight remote call per key, bounded size with
//! FIFO eviction, and best-effort persistence across sessions.
//!
//! # Design Philosophy
//!
//! Staleness is explicit. Every read returns a [`CacheRead<T>`] carrying the
//! [`Freshness`] classification the entry had when it was served, so callers
//! can render a stale indicator without reasoning about windows themselves.
//!
//! # Example
//!
//! ```ignore
//! let cache: FetchCache<ConversationDetail> = FetchCache::new(CacheConfig::default());
//! let key = CacheKey::with_params("conversation:detail", &json!({ "id": id }))?;
//!
//! let read = cache.get(&key, move || rest.fetch_detail(id)).await?;
//! if read.freshness().is_stale() {
//!     // a background refresh is already running
//! }
//! ```

pub mod entry;
pub mod fetch_cache;
pub mod freshness;
pub mod key;
pub mod lmdb_store;
pub mod persistence;
pub mod stats;

pub use entry::CacheEntry;
pub use fetch_cache::{CacheConfig, CacheValue, FetchCache, FetchCacheBuilder};
pub use freshness::{CacheRead, Freshness, FreshnessPolicy};
pub use key::CacheKey;
pub use lmdb_store::LmdbStore;
pub use persistence::{
    FileStore, KeyValueStore, MemoryStore, PersistenceAdapter, DEFAULT_STORAGE_KEY,
};
pub use stats::CacheStats;
