//! In-memory cache store.
//!
//! Same contract as the LMDB store minus durability. Useful for tests and for
//! clients that deliberately keep nothing on disk.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use freshet_core::{FreshetResult, ResourceKey, StorageError};

use crate::entry::CacheEntry;
use crate::traits::{CacheStats, LocalCacheStore};

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<ResourceKey, CacheEntry>,
    stats: CacheStats,
}

/// Cache store backed by a `HashMap` behind a lock.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    state: RwLock<MemoryState>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalCacheStore for InMemoryCacheStore {
    async fn get(&self, key: &ResourceKey) -> FreshetResult<Option<CacheEntry>> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let entry = state.entries.get(key).cloned();
        if entry.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        Ok(entry)
    }

    async fn put(&self, entry: CacheEntry) -> FreshetResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        state.stats.writes += 1;
        if state
            .entries
            .insert(entry.resource_key.clone(), entry)
            .is_none()
        {
            state.stats.entry_count += 1;
        }
        Ok(())
    }

    async fn clear(&self, key: &ResourceKey) -> FreshetResult<bool> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.stats.entry_count = state.stats.entry_count.saturating_sub(1);
        }
        Ok(removed)
    }

    async fn keys(&self) -> FreshetResult<Vec<ResourceKey>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.entries.keys().cloned().collect())
    }

    async fn stats(&self) -> FreshetResult<CacheStats> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::Sequence;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_clear() {
        let store = InMemoryCacheStore::new();
        let key = ResourceKey::new("current-user").expect("valid key");

        assert!(store.get(&key).await.expect("get").is_none());
        store
            .put(CacheEntry::new(key.clone(), json!({ "name": "a" }), Sequence::new(4)))
            .await
            .expect("put");

        let entry = store.get(&key).await.expect("get").expect("entry");
        assert_eq!(entry.last_synced_sequence, Sequence::new(4));

        assert!(store.clear(&key).await.expect("clear"));
        assert!(store.keys().await.expect("keys").is_empty());

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
    }
}
