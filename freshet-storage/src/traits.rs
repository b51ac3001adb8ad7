//! Local cache store trait.
//!
//! This module defines the trait implemented by the durable LMDB store and
//! the in-memory store used in tests and ephemeral clients.

use async_trait::async_trait;
use freshet_core::{FreshetResult, ResourceKey};

use crate::entry::CacheEntry;

/// Durable per-key storage of cache entries.
///
/// # Guarantees
///
/// - `put` atomically replaces the whole entry for its key
/// - concurrent readers observe either the old or the new entry, never a
///   partially written one
/// - no operation spans more than one key
#[async_trait]
pub trait LocalCacheStore: Send + Sync + 'static {
    /// Get the stored entry for a key, if any.
    async fn get(&self, key: &ResourceKey) -> FreshetResult<Option<CacheEntry>>;

    /// Atomically replace the entry stored under `entry.resource_key`.
    async fn put(&self, entry: CacheEntry) -> FreshetResult<()>;

    /// Remove the entry for a key. Returns whether an entry existed.
    async fn clear(&self, key: &ResourceKey) -> FreshetResult<bool>;

    /// List every key with a stored entry.
    async fn keys(&self) -> FreshetResult<Vec<ResourceKey>>;

    /// Get cache statistics.
    async fn stats(&self) -> FreshetResult<CacheStats>;
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found an entry.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
    /// Current number of entries.
    pub entry_count: u64,
    /// Number of successful puts.
    pub writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
