//! freshet Core - Shared Types
//!
//! Resource keys, sequences, invalidation events, the wire protocol and the
//! Resource Access Facade traits. Every other freshet crate depends on this
//! one; it contains no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod access;
pub mod error;
pub mod event;
pub mod key;
pub mod wire;

pub use access::{ResourceAccess, ResourceStore};
pub use error::{
    AccessError, ConfigError, FreshetError, FreshetResult, StorageError, TransportError,
    ValidationError,
};
pub use event::{InvalidationEvent, Sequence};
pub use key::{ResourceKey, MAX_KEY_LEN};
pub use wire::{ClientMessage, ServerMessage};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of one live server-side connection.
pub type SessionId = Uuid;

/// Opaque resource value. freshet never inspects it.
pub type Payload = serde_json::Value;

/// Generate a new UUIDv7 session id (timestamp-sortable).
pub fn new_session_id() -> SessionId {
    Uuid::now_v7()
}
