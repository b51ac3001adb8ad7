//! Sequences and invalidation events.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::key::ResourceKey;
use crate::Timestamp;

/// Per-resource change counter.
///
/// Sequences only ever move forward for a given key. A value of zero means
/// "no change observed yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence following this one. Saturates at `u64::MAX`.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Check if this sequence is strictly newer than another.
    pub fn is_newer_than(self, other: Sequence) -> bool {
        self.0 > other.0
    }

    /// Number of changes between `other` and this sequence (0 if older).
    pub fn gap(self, other: Sequence) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Seed derived from the wall clock, in microseconds since the epoch.
    ///
    /// Used as the counter floor of a freshly started server so that the
    /// first sequence it issues for a key is above anything a previous
    /// process could have issued.
    pub fn from_clock() -> Self {
        Self(Utc::now().timestamp_micros().max(0) as u64)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Signal that a resource's authoritative value changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub resource_key: ResourceKey,
    pub sequence: Sequence,
    pub caused_at: Timestamp,
}

impl InvalidationEvent {
    pub fn new(resource_key: ResourceKey, sequence: Sequence) -> Self {
        Self {
            resource_key,
            sequence,
            caused_at: Utc::now(),
        }
    }

    /// True when this event carries news relative to `last_seen`.
    pub fn supersedes(&self, last_seen: Sequence) -> bool {
        self.sequence.is_newer_than(last_seen)
    }
}
