//! Persistence adapter for cache entries.
//!
//! The whole entry collection is stored as one record, a JSON list of
//! `[key, entry]` pairs ordered by creation time, under a single
//! well-known storage key. Loading drops entries that are already past
//! `stale_until` and treats corrupt data as if nothing had been stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use chatline_core::{PersistenceError, Timestamp};

use crate::entry::CacheEntry;
use crate::key::CacheKey;

/// Storage key used when none is configured.
pub const DEFAULT_STORAGE_KEY: &str = "chatline.fetch-cache.v1";

/// A durable byte-oriented key-value store.
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Serializes a bounded collection of cache entries to a [`KeyValueStore`].
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("storage_key", &self.storage_key)
            .finish_non_exhaustive()
    }
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>, storage_key: impl Into<String>) -> Self {
        Self {
            store,
            storage_key: storage_key.into(),
        }
    }

    /// Adapter using [`DEFAULT_STORAGE_KEY`].
    pub fn with_default_key(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, DEFAULT_STORAGE_KEY)
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Load persisted entries, strictly.
    ///
    /// Returns an error for unreadable or corrupt records. Entries past
    /// `stale_until` at `now`, and entries whose windows are out of order,
    /// are dropped.
    pub async fn try_load<T>(
        &self,
        now: Timestamp,
    ) -> Result<Vec<(CacheKey, CacheEntry<T>)>, PersistenceError>
    where
        T: DeserializeOwned,
    {
        let Some(bytes) = self.store.get(&self.storage_key).await? else {
            return Ok(Vec::new());
        };
        let records: Vec<(CacheKey, CacheEntry<T>)> = serde_json::from_slice(&bytes)?;
        let total = records.len();
        let live: Vec<_> = records
            .into_iter()
            .filter(|(_, entry)| entry.is_well_formed() && entry.stale_until > now)
            .collect();
        debug!(
            storage_key = %self.storage_key,
            loaded = live.len(),
            dropped = total - live.len(),
            "Loaded persisted cache entries"
        );
        Ok(live)
    }

    /// Load persisted entries, resetting to empty on any failure.
    ///
    /// A corrupt record is also removed from the store so the next session
    /// starts clean.
    pub async fn load<T>(&self, now: Timestamp) -> Vec<(CacheKey, CacheEntry<T>)>
    where
        T: DeserializeOwned,
    {
        match self.try_load(now).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    storage_key = %self.storage_key,
                    error = %err,
                    "Discarding unreadable persisted cache"
                );
                if let Err(err) = self.store.delete(&self.storage_key).await {
                    warn!(
                        storage_key = %self.storage_key,
                        error = %err,
                        "Failed to remove unreadable persisted cache"
                    );
                }
                Vec::new()
            }
        }
    }

    /// Replace the persisted record with `entries`.
    pub async fn save<T>(&self, entries: &[(CacheKey, CacheEntry<T>)]) -> Result<(), PersistenceError>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(entries)?;
        self.store.put(&self.storage_key, &bytes).await
    }

    /// Remove the persisted record.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        self.store.delete(&self.storage_key).await
    }
}

// ============================================================================
// STORES
// ============================================================================

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes currently stored under `key`.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Overwrite `key` with arbitrary bytes.
    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.into());
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.raw(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.insert_raw(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// One JSON file per storage key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`. Characters outside `[A-Za-z0-9._-]` become `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, value).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
