//! Client facade wiring the connection manager to the synchronizer.

use std::sync::Arc;

use freshet_core::{FreshetResult, ResourceAccess, ResourceKey};
use freshet_storage::{CacheView, LmdbCacheStore, LocalCacheStore};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::ClientResult;
use crate::http::HttpResourceAccess;
use crate::sync::{CacheSynchronizer, SyncEvent};

/// A cache kept current by server push.
///
/// # Example
///
/// ```ignore
/// let client = FreshetClient::from_config(&ClientConfig::load()?)?;
/// client.start();
///
/// let user = client.watch(ResourceKey::new("current-user")?).await?;
/// let mut updates = client.updates();
/// while let Ok(event) = updates.recv().await {
///     // re-render
/// }
/// ```
#[derive(Clone)]
pub struct FreshetClient {
    connection: ConnectionManager,
    sync: CacheSynchronizer,
}

impl FreshetClient {
    /// Wire `connection` to `sync`. Neither is started.
    pub fn new(connection: ConnectionManager, sync: CacheSynchronizer) -> Self {
        connection.on_invalidation(Arc::new(sync.clone()));
        Self { connection, sync }
    }

    /// Build a client from its configuration: LMDB cache on disk, HTTP
    /// resource access and a WebSocket connection.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let store: Arc<dyn LocalCacheStore> =
            Arc::new(LmdbCacheStore::open(&config.cache.path, config.cache.max_size_mb)?);
        let access: Arc<dyn ResourceAccess> = Arc::new(HttpResourceAccess::new(
            config.api_base_url.clone(),
            config.request_timeout(),
        )?);
        let sync = CacheSynchronizer::new(store, access, config.sync.clone());
        let connection =
            ConnectionManager::new(config.ws_endpoint.clone(), config.reconnect.clone());
        info!(
            api = %config.api_base_url,
            ws = %config.ws_endpoint,
            cache = %config.cache.path.display(),
            "Client configured"
        );
        Ok(Self::new(connection, sync))
    }

    /// Start the connection supervisor.
    pub fn start(&self) {
        self.connection.start();
    }

    /// Register interest in `key` and return its current value.
    ///
    /// A stored entry is returned at once and verified in the background;
    /// otherwise this waits for the first fetch.
    pub async fn watch(&self, key: ResourceKey) -> FreshetResult<CacheView> {
        self.connection.subscribe(key.clone());
        self.sync.bootstrap(&key).await
    }

    /// Stop receiving invalidations for `key`. The entry stays cached but
    /// is reported stale from now on.
    pub fn unwatch(&self, key: &ResourceKey) {
        self.connection.unsubscribe(key);
        self.sync.release(key);
    }

    pub async fn read(&self, key: &ResourceKey) -> FreshetResult<Option<CacheView>> {
        self.sync.read(key).await
    }

    /// Stop watching `key` and drop its cached entry.
    pub async fn forget(&self, key: &ResourceKey) -> FreshetResult<bool> {
        self.connection.unsubscribe(key);
        self.sync.clear(key).await
    }

    pub fn updates(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.updates()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn sync(&self) -> &CacheSynchronizer {
        &self.sync
    }
}
