//! WebSocket Message Types
//!
//! Messages exchanged over the invalidation channel. Every frame is a JSON
//! text message, internally tagged by `type`. The channel carries freshness
//! signals only; resource payloads are always fetched through the
//! Resource Access Facade.

use serde::{Deserialize, Serialize};

use crate::event::{InvalidationEvent, Sequence};
use crate::key::ResourceKey;
use crate::{SessionId, Timestamp};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving invalidations for a key.
    Subscribe { resource_key: ResourceKey },

    /// Stop receiving invalidations for a key.
    Unsubscribe { resource_key: ResourceKey },
}

impl ClientMessage {
    pub fn resource_key(&self) -> &ResourceKey {
        match self {
            Self::Subscribe { resource_key } | Self::Unsubscribe { resource_key } => resource_key,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the session is registered.
    Connected {
        session_id: SessionId,
        connected_at: Timestamp,
    },

    /// Acknowledges a subscribe, carrying the key's current sequence.
    Subscribed {
        resource_key: ResourceKey,
        sequence: Sequence,
    },

    /// The resource changed; cached copies older than `sequence` are stale.
    Invalidated {
        resource_key: ResourceKey,
        sequence: Sequence,
        caused_at: Timestamp,
    },

    /// Protocol-level error, e.g. an undecodable client frame.
    Error { message: String },
}

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Subscribed { .. } => "subscribed",
            Self::Invalidated { .. } => "invalidated",
            Self::Error { .. } => "error",
        }
    }

    /// The resource key this message refers to, if any.
    pub fn resource_key(&self) -> Option<&ResourceKey> {
        match self {
            Self::Subscribed { resource_key, .. } | Self::Invalidated { resource_key, .. } => {
                Some(resource_key)
            }
            Self::Connected { .. } | Self::Error { .. } => None,
        }
    }
}

impl From<InvalidationEvent> for ServerMessage {
    fn from(event: InvalidationEvent) -> Self {
        Self::Invalidated {
            resource_key: event.resource_key,
            sequence: event.sequence,
            caused_at: event.caused_at,
        }
    }
}
