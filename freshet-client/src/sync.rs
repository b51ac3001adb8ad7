//! Cache Synchronizer
//!
//! Consumes invalidation signals, refetches through the Resource Access
//! Facade and writes the results into the Local Cache Store.
//!
//! ## Per-key state machine
//!
//! - At most one refresh per key is in flight
//! - Invalidations arriving meanwhile collapse into one follow-up refresh
//!   at the highest sequence seen
//! - A failed refresh leaves the stored entry untouched; after
//!   `degraded_after` failures in a row the key is reported degraded
//! - Reads never wait for a refresh

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use freshet_core::{
    AccessError, FreshetError, FreshetResult, InvalidationEvent, Payload, ResourceAccess,
    ResourceKey, Sequence,
};
use freshet_storage::{CacheEntry, CacheView, Freshness, LocalCacheStore};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::InvalidationHandler;

/// Notification for the render layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new value was stored for the key.
    Updated {
        resource_key: ResourceKey,
        sequence: Sequence,
    },
    /// Refreshing the key keeps failing; its entry may be arbitrarily old.
    Degraded {
        resource_key: ResourceKey,
        consecutive_failures: u32,
    },
    /// The entry was removed.
    Cleared { resource_key: ResourceKey },
}

/// Synchronizer counters.
#[derive(Debug, Default)]
pub struct SyncStats {
    refreshes_started: AtomicU64,
    refreshes_succeeded: AtomicU64,
    refreshes_failed: AtomicU64,
    coalesced: AtomicU64,
    stale_discarded: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub coalesced: u64,
    pub stale_discarded: u64,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refreshes_succeeded: self.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_failed: self.refreshes_failed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of the most recent completed refresh attempt for a key.
#[derive(Debug, Clone)]
struct Completion {
    generation: u64,
    result: Option<Result<Sequence, FreshetError>>,
}

struct KeyState {
    /// Highest sequence seen for the key.
    seen: Sequence,
    in_flight: bool,
    /// Follow-up refresh requested while one was in flight.
    pending: Option<Sequence>,
    /// Set until a refresh answering `seen` succeeds.
    dirty: bool,
    consecutive_failures: u32,
    /// Distinguishes this state from one recreated after a clear.
    epoch: u64,
    /// Drop the state once the in-flight refresh finishes.
    released: bool,
    completed: watch::Sender<Completion>,
}

impl KeyState {
    fn new(epoch: u64) -> Self {
        let (completed, _) = watch::channel(Completion {
            generation: 0,
            result: None,
        });
        Self {
            seen: Sequence::ZERO,
            in_flight: false,
            pending: None,
            dirty: false,
            consecutive_failures: 0,
            epoch,
            released: false,
            completed,
        }
    }

    fn generation(&self) -> u64 {
        self.completed.borrow().generation
    }
}

/// Handle on a scheduled refresh.
#[derive(Debug)]
pub struct RefreshTicket {
    resource_key: ResourceKey,
    completed: watch::Receiver<Completion>,
    required: u64,
}

impl RefreshTicket {
    pub fn resource_key(&self) -> &ResourceKey {
        &self.resource_key
    }

    /// Wait until the refresh covering this request finished. Returns the
    /// sequence stored by the latest completed attempt, or its error.
    pub async fn wait(mut self) -> FreshetResult<Sequence> {
        let required = self.required;
        let completion = self
            .completed
            .wait_for(|c| c.generation >= required)
            .await
            .map(|c| c.clone())
            .map_err(|_| cancelled(&self.resource_key))?;
        completion
            .result
            .unwrap_or_else(|| Err(cancelled(&self.resource_key)))
    }
}

fn cancelled(key: &ResourceKey) -> FreshetError {
    AccessError::Transient {
        key: key.to_string(),
        reason: "refresh cancelled because the entry was cleared".to_string(),
    }
    .into()
}

/// Why a refresh is requested.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// Pushed invalidation; ignored unless newer than anything seen.
    Invalidation(Sequence),
    /// Reconnect resync; always refetches.
    Resync(Sequence),
    /// Explicit or bootstrap refresh; always refetches.
    Manual,
}

struct SyncInner {
    store: Arc<dyn LocalCacheStore>,
    access: Arc<dyn ResourceAccess>,
    config: SyncConfig,
    keys: Mutex<HashMap<ResourceKey, KeyState>>,
    epochs: AtomicU64,
    /// Serializes store writes against `clear`.
    write_gate: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<SyncEvent>,
    stats: SyncStats,
}

/// Keeps the Local Cache Store in step with the backing store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheSynchronizer {
    inner: Arc<SyncInner>,
}

impl CacheSynchronizer {
    pub fn new(
        store: Arc<dyn LocalCacheStore>,
        access: Arc<dyn ResourceAccess>,
        config: SyncConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            inner: Arc::new(SyncInner {
                store,
                access,
                config,
                keys: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                write_gate: tokio::sync::Mutex::new(()),
                updates,
                stats: SyncStats::default(),
            }),
        }
    }

    /// React to a pushed invalidation.
    ///
    /// Returns `None` when the event is stale or a duplicate, otherwise the
    /// ticket of the refresh that will answer it.
    pub async fn handle_invalidation(&self, event: InvalidationEvent) -> Option<RefreshTicket> {
        let key = event.resource_key;
        match self.inner.store.get(&key).await {
            Ok(Some(entry)) if entry.last_synced_sequence >= event.sequence => {
                bump(&self.inner.stats.stale_discarded);
                debug!(
                    resource_key = %key,
                    sequence = %event.sequence,
                    stored = %entry.last_synced_sequence,
                    "Stored entry already answers invalidation"
                );
                return None;
            }
            Ok(_) => {}
            Err(e) => warn!(resource_key = %key, error = %e, "Cache lookup failed, refreshing anyway"),
        }
        self.inner.request(&key, Trigger::Invalidation(event.sequence))
    }

    /// Force a refetch after (re)connect. `sequence` is the server's current
    /// counter for the key.
    pub fn resync(&self, key: &ResourceKey, sequence: Sequence) -> RefreshTicket {
        self.inner
            .request(key, Trigger::Resync(sequence))
            .unwrap_or_else(|| self.inner.idle_ticket(key))
    }

    /// Explicit refetch regardless of freshness.
    pub fn refresh(&self, key: &ResourceKey) -> RefreshTicket {
        self.inner
            .request(key, Trigger::Manual)
            .unwrap_or_else(|| self.inner.idle_ticket(key))
    }

    /// Cold-start read.
    ///
    /// Returns the stored entry immediately and verifies it in the
    /// background. Without a stored entry, waits for the first fetch.
    pub async fn bootstrap(&self, key: &ResourceKey) -> FreshetResult<CacheView> {
        if let Some(entry) = self.inner.store.get(key).await? {
            let _ = self.refresh(key);
            let freshness = self.inner.freshness(&entry);
            return Ok(CacheView::new(entry, freshness));
        }

        self.refresh(key).wait().await?;
        match self.read(key).await? {
            Some(view) => Ok(view),
            None => Err(cancelled(key)),
        }
    }

    /// Non-blocking read of the stored entry plus its freshness flag.
    pub async fn read(&self, key: &ResourceKey) -> FreshetResult<Option<CacheView>> {
        let entry = self.inner.store.get(key).await?;
        Ok(entry.map(|entry| {
            let freshness = self.inner.freshness(&entry);
            CacheView::new(entry, freshness)
        }))
    }

    /// Remove the entry and forget everything known about the key.
    /// Refreshes still in flight for it will not write.
    pub async fn clear(&self, key: &ResourceKey) -> FreshetResult<bool> {
        let _gate = self.inner.write_gate.lock().await;
        self.inner.lock_keys().remove(key);
        let existed = self.inner.store.clear(key).await?;
        let _ = self.inner.updates.send(SyncEvent::Cleared {
            resource_key: key.clone(),
        });
        info!(resource_key = %key, existed, "Cache entry cleared");
        Ok(existed)
    }

    /// Forget the tracking state of `key` while keeping its stored entry.
    ///
    /// State with a refresh in flight is dropped when that refresh ends.
    /// Returns `true` if the state was dropped right away.
    pub fn release(&self, key: &ResourceKey) -> bool {
        let mut keys = self.inner.lock_keys();
        let Some(state) = keys.get_mut(key) else {
            return false;
        };
        if state.in_flight {
            state.released = true;
            return false;
        }
        keys.remove(key);
        debug!(resource_key = %key, "Released synchronizer state");
        true
    }

    /// Subscribe to render-layer notifications.
    pub fn updates(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.updates.subscribe()
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.inner
            .lock_keys()
            .get(key)
            .is_some_and(|state| state.in_flight)
    }
}

impl InvalidationHandler for CacheSynchronizer {
    fn on_invalidation(&self, event: InvalidationEvent) {
        let sync = self.clone();
        tokio::spawn(async move {
            sync.handle_invalidation(event).await;
        });
    }

    fn on_resync(&self, key: ResourceKey, sequence: Sequence) {
        let _ = self.resync(&key, sequence);
    }
}

impl SyncInner {
    fn lock_keys(&self) -> MutexGuard<'_, HashMap<ResourceKey, KeyState>> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn freshness(&self, entry: &CacheEntry) -> Freshness {
        let keys = self.lock_keys();
        let Some(state) = keys.get(&entry.resource_key) else {
            // Nothing heard about this key since startup
            return Freshness::Stale;
        };
        if state.consecutive_failures >= self.config.degraded_after {
            Freshness::Degraded {
                consecutive_failures: state.consecutive_failures,
            }
        } else if state.dirty
            || state.in_flight
            || state.seen.is_newer_than(entry.last_synced_sequence)
        {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    fn idle_ticket(&self, key: &ResourceKey) -> RefreshTicket {
        let (tx, rx) = watch::channel(Completion {
            generation: 0,
            result: None,
        });
        drop(tx);
        RefreshTicket {
            resource_key: key.clone(),
            completed: rx,
            required: 1,
        }
    }

    /// Schedule or coalesce a refresh. Runs entirely under the key lock so
    /// two callers can never both start a refresh for one key.
    fn request(self: &Arc<Self>, key: &ResourceKey, trigger: Trigger) -> Option<RefreshTicket> {
        let mut keys = self.lock_keys();
        let state = keys
            .entry(key.clone())
            .or_insert_with(|| KeyState::new(self.epochs.fetch_add(1, Ordering::Relaxed)));

        match trigger {
            Trigger::Invalidation(sequence) => {
                if !sequence.is_newer_than(state.seen) {
                    bump(&self.stats.stale_discarded);
                    debug!(
                        resource_key = %key,
                        sequence = %sequence,
                        seen = %state.seen,
                        "Discarding stale or duplicate invalidation"
                    );
                    return None;
                }
                state.seen = sequence;
            }
            Trigger::Resync(sequence) => state.seen = state.seen.max(sequence),
            Trigger::Manual => {}
        }
        state.dirty = true;
        state.released = false;

        let generation = state.generation();
        let target = state.seen;
        let required = if state.in_flight {
            state.pending = Some(state.pending.map_or(target, |p| p.max(target)));
            bump(&self.stats.coalesced);
            debug!(resource_key = %key, sequence = %target, "Coalesced into in-flight refresh");
            generation + 2
        } else {
            state.in_flight = true;
            bump(&self.stats.refreshes_started);
            tokio::spawn(run_refresh(self.clone(), key.clone(), state.epoch, target));
            generation + 1
        };

        Some(RefreshTicket {
            resource_key: key.clone(),
            completed: state.completed.subscribe(),
            required,
        })
    }

    async fn store_payload(
        &self,
        key: &ResourceKey,
        payload: Payload,
        target: Sequence,
        epoch: u64,
    ) -> FreshetResult<Option<Sequence>> {
        let _gate = self.write_gate.lock().await;
        {
            // The key was cleared (and maybe re-requested) while fetching
            let keys = self.lock_keys();
            match keys.get(key) {
                Some(state) if state.epoch == epoch => {}
                _ => return Ok(None),
            }
        }

        let existing = self
            .store
            .get(key)
            .await?
            .map_or(Sequence::ZERO, |entry| entry.last_synced_sequence);
        let sequence = target.max(existing);
        self.store
            .put(CacheEntry::new(key.clone(), payload, sequence))
            .await?;
        Ok(Some(sequence))
    }
}

async fn run_refresh(inner: Arc<SyncInner>, key: ResourceKey, epoch: u64, mut target: Sequence) {
    loop {
        debug!(resource_key = %key, sequence = %target, "Refreshing");
        let result = match inner.access.read(&key).await {
            Ok(payload) => inner.store_payload(&key, payload, target, epoch).await,
            Err(e) => Err(FreshetError::from(e)),
        };

        let mut events = Vec::new();
        let next = {
            let mut keys = inner.lock_keys();
            let state = match keys.get_mut(&key) {
                Some(state) if state.epoch == epoch => state,
                _ => return,
            };

            let outcome = match result {
                Ok(Some(stored)) => {
                    bump(&inner.stats.refreshes_succeeded);
                    state.consecutive_failures = 0;
                    state.dirty = state.seen.is_newer_than(stored) || state.pending.is_some();
                    events.push(SyncEvent::Updated {
                        resource_key: key.clone(),
                        sequence: stored,
                    });
                    Ok(stored)
                }
                Ok(None) => return,
                Err(e) => {
                    bump(&inner.stats.refreshes_failed);
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    warn!(
                        resource_key = %key,
                        error = %e,
                        consecutive_failures = state.consecutive_failures,
                        "Refresh failed, keeping stored entry"
                    );
                    if state.consecutive_failures >= inner.config.degraded_after {
                        events.push(SyncEvent::Degraded {
                            resource_key: key.clone(),
                            consecutive_failures: state.consecutive_failures,
                        });
                    }
                    Err(e)
                }
            };

            let next = state.pending.take();
            if next.is_none() {
                state.in_flight = false;
            } else {
                bump(&inner.stats.refreshes_started);
            }
            state.completed.send_modify(|c| {
                c.generation += 1;
                c.result = Some(outcome);
            });
            if next.is_none() && state.released {
                keys.remove(&key);
                debug!(resource_key = %key, "Released synchronizer state");
            }
            next
        };

        for event in events {
            let _ = inner.updates.send(event);
        }

        match next {
            Some(sequence) => target = sequence,
            None => break,
        }
    }
}
