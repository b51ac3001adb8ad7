//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep the last-known-good
//! snapshot of every resource in a memory-mapped file that survives process
//! restarts.
//!
//! # Atomicity
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get` and `keys`
//! - One write transaction per `put` and `clear`
//!
//! A reader therefore sees either the previous committed entry or the new
//! one. Statistics are kept in memory only.

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use freshet_core::{FreshetResult, ResourceKey, StorageError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::traits::{CacheStats, LocalCacheStore};

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to create the directory or open the LMDB environment in it.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl From<LmdbCacheError> for StorageError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::EnvOpen { path, reason } => StorageError::OpenFailed { path, reason },
            other => StorageError::TransactionFailed {
                reason: other.to_string(),
            },
        }
    }
}

impl From<LmdbCacheError> for freshet_core::FreshetError {
    fn from(e: LmdbCacheError) -> Self {
        StorageError::from(e).into()
    }
}

/// LMDB-backed cache store.
///
/// # Example
///
/// ```ignore
/// use freshet_storage::{CacheEntry, LmdbCacheStore, LocalCacheStore};
///
/// let store = LmdbCacheStore::open("/var/lib/app/cache", 64)?;
/// store.put(CacheEntry::new(key.clone(), payload, Sequence::new(1))).await?;
/// let cached = store.get(&key).await?;
/// ```
pub struct LmdbCacheStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Global statistics.
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbCacheStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        let open_failed = |reason: String| LmdbCacheError::EnvOpen {
            path: path.as_ref().display().to_string(),
            reason,
        };
        std::fs::create_dir_all(&path).map_err(|e| open_failed(e.to_string()))?;

        // SAFETY: the environment is opened once per path by this process and
        // the files are not truncated or modified outside of LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| open_failed(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        let entry_count = db
            .len(&wtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        debug!(path = %path.as_ref().display(), entries = entry_count, "Opened LMDB cache store");

        Ok(Self {
            env,
            db,
            stats: Arc::new(RwLock::new(CacheStats {
                entry_count,
                ..CacheStats::default()
            })),
        })
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
        }
    }
}

#[async_trait]
impl LocalCacheStore for LmdbCacheStore {
    async fn get(&self, key: &ResourceKey) -> FreshetResult<Option<CacheEntry>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let bytes = match self.db.get(&rtxn, key.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.record_miss();
                return Ok(None);
            }
            Err(e) => {
                self.record_miss();
                return Err(LmdbCacheError::Transaction(e.to_string()).into());
            }
        };

        self.record_hit();
        let entry = CacheEntry::decode(key.clone(), bytes)?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: CacheEntry) -> FreshetResult<()> {
        let bytes = entry.encode()?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let is_new = self
            .db
            .get(&wtxn, entry.resource_key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            .is_none();

        self.db
            .put(&mut wtxn, entry.resource_key.as_bytes(), &bytes)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.writes += 1;
            if is_new {
                stats.entry_count += 1;
            }
        }

        Ok(())
    }

    async fn clear(&self, key: &ResourceKey) -> FreshetResult<bool> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if deleted {
            if let Ok(mut stats) = self.stats.write() {
                stats.entry_count = stats.entry_count.saturating_sub(1);
            }
        }

        Ok(deleted)
    }

    async fn keys(&self) -> FreshetResult<Vec<ResourceKey>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            let (raw, _) = result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            match ResourceKey::from_bytes(raw) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(error = %e, "Skipping undecodable cache key"),
            }
        }

        Ok(keys)
    }

    async fn stats(&self) -> FreshetResult<CacheStats> {
        Ok(self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::Sequence;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbCacheStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbCacheStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn key(s: &str) -> ResourceKey {
        ResourceKey::new(s).expect("valid key")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store();

        let entry = CacheEntry::new(key("U1"), json!({ "name": "a" }), Sequence::ZERO);
        store.put(entry.clone()).await.expect("put should succeed");

        let cached = store
            .get(&key("U1"))
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(cached.payload, json!({ "name": "a" }));
        assert_eq!(cached.last_synced_sequence, Sequence::ZERO);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp_dir) = create_test_store();
        let cached = store.get(&key("missing")).await.expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (store, _temp_dir) = create_test_store();

        store
            .put(CacheEntry::new(key("U1"), json!({ "name": "a" }), Sequence::ZERO))
            .await
            .expect("put should succeed");
        store
            .put(CacheEntry::new(key("U1"), json!({ "name": "b" }), Sequence::new(1)))
            .await
            .expect("put should succeed");

        let cached = store
            .get(&key("U1"))
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(cached.payload, json!({ "name": "b" }));
        assert_eq!(cached.last_synced_sequence, Sequence::new(1));

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.writes, 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _temp_dir) = create_test_store();

        store
            .put(CacheEntry::new(key("current-user"), json!(1), Sequence::ZERO))
            .await
            .expect("put should succeed");
        assert!(store.clear(&key("current-user")).await.expect("clear should succeed"));
        assert!(!store.clear(&key("current-user")).await.expect("clear should succeed"));
        assert!(store
            .get(&key("current-user"))
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_keys() {
        let (store, _temp_dir) = create_test_store();
        for name in ["a", "b", "c"] {
            store
                .put(CacheEntry::new(key(name), json!(name), Sequence::ZERO))
                .await
                .expect("put should succeed");
        }
        let mut keys = store.keys().await.expect("keys should succeed");
        keys.sort();
        assert_eq!(keys, vec![key("a"), key("b"), key("c")]);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbCacheStore::open(temp_dir.path(), 10).expect("open should succeed");
            store
                .put(CacheEntry::new(key("U1"), json!({ "name": "b" }), Sequence::new(1)))
                .await
                .expect("put should succeed");
        }

        let reopened = LmdbCacheStore::open(temp_dir.path(), 10).expect("reopen should succeed");
        let cached = reopened
            .get(&key("U1"))
            .await
            .expect("get should succeed")
            .expect("entry should survive reopen");
        assert_eq!(cached.payload, json!({ "name": "b" }));
        assert_eq!(cached.last_synced_sequence, Sequence::new(1));
        assert_eq!(
            reopened.stats().await.expect("stats should succeed").entry_count,
            1
        );
    }

    #[tokio::test]
    async fn test_longest_valid_key_round_trips() {
        let (store, _temp_dir) = create_test_store();
        let long = key(&"k".repeat(freshet_core::MAX_KEY_LEN));

        store
            .put(CacheEntry::new(long.clone(), json!({ "name": "a" }), Sequence::new(2)))
            .await
            .expect("put of a maximum-length key should succeed");
        let cached = store
            .get(&long)
            .await
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(cached.last_synced_sequence, Sequence::new(2));
        assert_eq!(store.keys().await.expect("keys should succeed"), vec![long]);
    }

    #[test]
    fn test_open_failure_maps_to_open_failed() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write should succeed");

        let err = match LmdbCacheStore::open(blocker.join("cache"), 10) {
            Ok(_) => panic!("open below a regular file should fail"),
            Err(e) => e,
        };
        assert!(matches!(
            StorageError::from(err),
            StorageError::OpenFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _temp_dir) = create_test_store();

        let _ = store.get(&key("U1")).await;
        store
            .put(CacheEntry::new(key("U1"), json!(null), Sequence::ZERO))
            .await
            .expect("put should succeed");
        let _ = store.get(&key("U1")).await;
        let _ = store.get(&key("U1")).await;

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }
}
