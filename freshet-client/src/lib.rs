//! freshet Client - Push-Invalidated Local Cache
//!
//! Keeps a durable local copy of server-owned resources current without
//! polling. The [`ConnectionManager`] holds the WebSocket open and
//! deduplicates invalidations; the [`CacheSynchronizer`] refetches through
//! the resource access facade and writes the Local Cache Store.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod sync;

pub use client::FreshetClient;
pub use config::{CacheConfig, ClientConfig, ClientConfigError, ReconnectConfig, SyncConfig};
pub use connection::{
    backoff_delay, ClientConnectionState, ConnectionManager, ConnectionStatsSnapshot,
    ConnectionStatus, InvalidationHandler,
};
pub use error::{ClientError, ClientResult};
pub use http::HttpResourceAccess;
pub use sync::{CacheSynchronizer, RefreshTicket, SyncEvent, SyncStatsSnapshot};
