//! freshet Server - Change Broadcaster and WebSocket Endpoint
//!
//! Hosts the authoritative side of freshet: the [`ChangeBroadcaster`] that
//! assigns per-key sequences and fans invalidations out to live sessions,
//! the WebSocket endpoint clients hold open, and a small REST surface over
//! the backing store whose writes feed the broadcaster.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod macros;
pub mod routes;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod ws;

// Re-export commonly used types
pub use broadcaster::{
    BroadcasterConfig, ChangeBroadcaster, ConnectionSession, Delivery, SessionChannel,
};
pub use config::{SequenceFloor, ServerConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use routes::create_router;
pub use state::AppState;
pub use store::{InMemoryResourceStore, NotifyingStore};
