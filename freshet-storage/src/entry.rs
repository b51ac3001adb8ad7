//! Cache entries and their on-disk encoding.

use chrono::{DateTime, Utc};
use freshet_core::{Payload, ResourceKey, Sequence, StorageError, Timestamp};
use serde::{Deserialize, Serialize};

/// Size of the fixed header preceding the JSON payload.
const HEADER_LEN: usize = 16;

/// Last-known-good snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_key: ResourceKey,
    pub payload: Payload,
    /// Sequence of the invalidation this payload answers. Never decreases
    /// for a given key.
    pub last_synced_sequence: Sequence,
    pub stored_at: Timestamp,
}

impl CacheEntry {
    pub fn new(resource_key: ResourceKey, payload: Payload, last_synced_sequence: Sequence) -> Self {
        Self {
            resource_key,
            payload,
            last_synced_sequence,
            stored_at: Utc::now(),
        }
    }

    /// Encode as `[sequence: u64 LE][stored_at millis: i64 LE][json payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let payload =
            serde_json::to_vec(&self.payload).map_err(|e| StorageError::SerializationFailed {
                key: self.resource_key.to_string(),
                reason: e.to_string(),
            })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&self.last_synced_sequence.value().to_le_bytes());
        bytes.extend_from_slice(&self.stored_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode bytes produced by [`CacheEntry::encode`].
    pub fn decode(resource_key: ResourceKey, bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < HEADER_LEN {
            return Err(StorageError::CorruptEntry {
                key: resource_key.to_string(),
                reason: format!("expected at least {} bytes, got {}", HEADER_LEN, bytes.len()),
            });
        }

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[0..8]);
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&bytes[8..16]);

        let stored_at = DateTime::from_timestamp_millis(i64::from_le_bytes(millis)).ok_or_else(
            || StorageError::CorruptEntry {
                key: resource_key.to_string(),
                reason: "stored_at out of range".to_string(),
            },
        )?;

        let payload =
            serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| StorageError::CorruptEntry {
                key: resource_key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            resource_key,
            payload,
            last_synced_sequence: Sequence::new(u64::from_le_bytes(sequence)),
            stored_at,
        })
    }
}
