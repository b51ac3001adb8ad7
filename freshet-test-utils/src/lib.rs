//! freshet Test Utilities
//!
//! Shared test infrastructure for the freshet workspace:
//! - A scriptable resource access mock with fetch counting, gating and
//!   failure injection
//! - Proptest generators for keys, sequences and cache entries
//! - Fixtures for temporary cache stores
//! - Assertions on cache views

pub use freshet_core::{
    AccessError, FreshetError, FreshetResult, InvalidationEvent, Payload, ResourceAccess,
    ResourceKey, ResourceStore, Sequence,
};
pub use freshet_storage::{
    CacheEntry, CacheView, Freshness, InMemoryCacheStore, LmdbCacheStore, LocalCacheStore,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

// ============================================================================
// MOCK RESOURCE ACCESS
// ============================================================================

/// In-memory [`ResourceAccess`] for driving the synchronizer in tests.
///
/// Every `read` is counted. While [`hold`](Self::hold) is in effect reads
/// block after being counted, until [`release`](Self::release).
#[derive(Debug)]
pub struct MockResourceAccess {
    values: Mutex<HashMap<ResourceKey, Payload>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    gate: watch::Sender<bool>,
}

impl Default for MockResourceAccess {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            values: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            gate,
        }
    }
}

impl MockResourceAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (ResourceKey, Payload)>) -> Self {
        let mock = Self::default();
        mock.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(entries);
        mock
    }

    /// Set the authoritative value returned for `key`.
    pub fn set(&self, key: &ResourceKey, payload: Payload) {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), payload);
    }

    pub fn remove(&self, key: &ResourceKey) {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }

    /// Make every read fail with a transient error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Block reads until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Number of reads issued so far, including blocked ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` reads were issued.
    pub async fn wait_for_fetches(&self, count: usize) {
        while self.fetch_count() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ResourceAccess for MockResourceAccess {
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(AccessError::Transient {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| AccessError::NotFound {
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ResourceStore for MockResourceAccess {
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError> {
        self.set(key, payload.clone());
        Ok(payload)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for freshet types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// Generate a valid ResourceKey.
    pub fn arb_resource_key() -> impl Strategy<Value = ResourceKey> {
        "[a-zA-Z0-9_:/ .-]{1,64}".prop_filter_map("valid key", |s| ResourceKey::new(s).ok())
    }

    pub fn arb_sequence() -> impl Strategy<Value = Sequence> {
        (0u64..1_000_000).prop_map(Sequence::new)
    }

    /// Generate a small JSON object payload.
    pub fn arb_payload() -> impl Strategy<Value = Payload> {
        ("[a-z]{0,16}", any::<i64>(), any::<bool>())
            .prop_map(|(name, rev, active)| json!({ "name": name, "rev": rev, "active": active }))
    }

    pub fn arb_cache_entry() -> impl Strategy<Value = CacheEntry> {
        (arb_resource_key(), arb_payload(), arb_sequence())
            .prop_map(|(key, payload, sequence)| CacheEntry::new(key, payload, sequence))
    }

    /// A run of invalidation sequences for one key, in arbitrary order and
    /// with duplicates.
    pub fn arb_sequence_run(max_len: usize) -> impl Strategy<Value = Vec<Sequence>> {
        prop::collection::vec((1u64..50).prop_map(Sequence::new), 1..max_len.max(2))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Build a key, panicking on invalid input.
    #[track_caller]
    pub fn test_key(key: &str) -> ResourceKey {
        match ResourceKey::new(key) {
            Ok(key) => key,
            Err(e) => panic!("invalid test key {key:?}: {e}"),
        }
    }

    /// The profile payload used by the U1 scenarios.
    pub fn profile(name: &str) -> Payload {
        json!({ "name": name })
    }

    /// Open an LMDB cache store in a fresh temporary directory. Keep the
    /// returned directory alive for as long as the store is used.
    #[track_caller]
    pub fn temp_lmdb_store() -> (LmdbCacheStore, TempDir) {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => panic!("temp dir creation failed: {e}"),
        };
        let store = match LmdbCacheStore::open(dir.path(), 16) {
            Ok(store) => store,
            Err(e) => panic!("LMDB store creation failed: {e}"),
        };
        (store, dir)
    }

    /// An in-memory store pre-populated with `entries`.
    pub async fn seeded_memory_store(entries: Vec<CacheEntry>) -> InMemoryCacheStore {
        let store = InMemoryCacheStore::new();
        for entry in entries {
            if let Err(e) = store.put(entry).await {
                panic!("seeding cache store failed: {e}");
            }
        }
        store
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on cache reads.

    use super::*;

    #[track_caller]
    pub fn assert_view(view: &CacheView, payload: &Payload, sequence: Sequence) {
        assert_eq!(view.payload(), payload, "unexpected cached payload");
        assert_eq!(view.sequence(), sequence, "unexpected cached sequence");
    }

    #[track_caller]
    pub fn assert_fresh(view: &CacheView) {
        assert!(
            view.is_fresh(),
            "Expected fresh entry, got {:?}",
            view.freshness()
        );
    }

    #[track_caller]
    pub fn assert_not_fresh(view: &CacheView) {
        assert!(
            !view.is_fresh(),
            "Expected stale or degraded entry for {}",
            view.entry().resource_key
        );
    }

    #[track_caller]
    pub fn assert_degraded(view: &CacheView) {
        assert!(
            view.freshness().is_degraded(),
            "Expected degraded entry, got {:?}",
            view.freshness()
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
