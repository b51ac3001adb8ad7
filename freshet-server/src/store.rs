//! Backing stores for the server write path.
//!
//! [`InMemoryResourceStore`] is the reference backing store used by the
//! server binary. [`NotifyingStore`] wraps any [`ResourceStore`] and signals
//! the broadcaster after each successful write.
//!
//! # Example
//!
//! ```ignore
//! let broadcaster = Arc::new(ChangeBroadcaster::default());
//! let store = NotifyingStore::new(InMemoryResourceStore::new(), broadcaster.clone());
//!
//! // Subscribers of "U1" receive an invalidation after this returns
//! store.write(&key, json!({ "name": "b" })).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use freshet_core::{AccessError, Payload, ResourceAccess, ResourceKey, ResourceStore};
use tokio::sync::RwLock;
use tracing::debug;

use crate::broadcaster::ChangeBroadcaster;
use crate::telemetry::metrics;

/// Authoritative resource values held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    resources: RwLock<HashMap<ResourceKey, Payload>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`. Seeding does not notify.
    pub fn with_entries(entries: impl IntoIterator<Item = (ResourceKey, Payload)>) -> Self {
        Self {
            resources: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceAccess for InMemoryResourceStore {
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError> {
        self.resources
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| AccessError::NotFound {
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError> {
        self.resources
            .write()
            .await
            .insert(key.clone(), payload.clone());
        Ok(payload)
    }
}

/// A store wrapper that notifies the broadcaster after successful writes.
///
/// Exactly one `notify_changed` is issued per successful write, and none
/// for a failed one. Reads pass straight through.
pub struct NotifyingStore<S: ResourceStore> {
    inner: S,
    broadcaster: Arc<ChangeBroadcaster>,
}

impl<S: ResourceStore> NotifyingStore<S> {
    pub fn new(inner: S, broadcaster: Arc<ChangeBroadcaster>) -> Self {
        Self { inner, broadcaster }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn broadcaster(&self) -> &Arc<ChangeBroadcaster> {
        &self.broadcaster
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceAccess for NotifyingStore<S> {
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError> {
        self.inner.read(key).await
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for NotifyingStore<S> {
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError> {
        match self.inner.write(key, payload).await {
            Ok(stored) => {
                let delivery = self.broadcaster.notify_changed(key);
                metrics::record(|m| m.resource_writes_total.with_label_values(&["ok"]).inc());
                debug!(
                    resource_key = %key,
                    sequence = %delivery.event.sequence,
                    subscribers = delivery.delivered,
                    "Write applied"
                );
                Ok(stored)
            }
            Err(e) => {
                metrics::record(|m| {
                    m.resource_writes_total.with_label_values(&["error"]).inc()
                });
                Err(e)
            }
        }
    }
}
