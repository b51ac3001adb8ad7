//! Shared application state for Axum routers.

use std::sync::Arc;

use freshet_core::ResourceStore;

use crate::broadcaster::ChangeBroadcaster;
use crate::store::NotifyingStore;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Session registry and per-key counters.
    pub broadcaster: Arc<ChangeBroadcaster>,
    /// Backing store, always wrapped so that writes notify the broadcaster.
    pub store: Arc<dyn ResourceStore>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wrap `inner` in a [`NotifyingStore`] bound to `broadcaster`.
    pub fn new<S: ResourceStore + 'static>(inner: S, broadcaster: Arc<ChangeBroadcaster>) -> Self {
        let store = NotifyingStore::new(inner, broadcaster.clone());
        Self {
            broadcaster,
            store: Arc::new(store),
            start_time: std::time::Instant::now(),
        }
    }
}

crate::impl_from_ref!(Arc<ChangeBroadcaster>, broadcaster);
crate::impl_from_ref!(Arc<dyn ResourceStore>, store);
crate::impl_from_ref!(std::time::Instant, start_time);
