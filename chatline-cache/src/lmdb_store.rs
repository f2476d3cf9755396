//! LMDB-backed key-value store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep the persisted cache
//! record in a memory-mapped file. A single unnamed database holds
//! string keys and opaque byte values.

use std::path::Path;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use chatline_core::PersistenceError;

use crate::persistence::KeyValueStore;

fn backend_error(err: heed::Error) -> PersistenceError {
    PersistenceError::Backend {
        reason: err.to_string(),
    }
}

/// LMDB key-value store.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(LmdbStore::open("/var/lib/chatline/cache", 16)?);
/// let adapter = PersistenceAdapter::with_default_key(store);
/// ```
#[derive(Clone)]
pub struct LmdbStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbStore {
    /// Open (or create) an LMDB environment in `path`.
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment directory is owned by this store; no other
        // process is expected to open it with different flags.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.max(1) * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(backend_error)?;

        let mut wtxn = env.write_txn().map_err(backend_error)?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(backend_error)?;
        wtxn.commit().map_err(backend_error)?;

        Ok(Self { env, db })
    }
}

#[async_trait]
impl KeyValueStore for LmdbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(backend_error)?;
        let value = self
            .db
            .get(&rtxn, key)
            .map_err(backend_error)?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(backend_error)?;
        self.db.put(&mut wtxn, key, value).map_err(backend_error)?;
        wtxn.commit().map_err(backend_error)
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(backend_error)?;
        self.db.delete(&mut wtxn, key).map_err(backend_error)?;
        wtxn.commit().map_err(backend_error)
    }
}
