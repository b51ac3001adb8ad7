//! Freshness flags for cache reads.
//!
//! Every read handed to the render layer carries a [`Freshness`] so the
//! consumer can decide whether to show a stale-data indicator. The cache
//! never hides staleness.

use std::time::Duration;

use chrono::Utc;
use freshet_core::{Payload, Sequence, Timestamp};

use crate::entry::CacheEntry;

/// How much the consumer can trust a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The entry answers the newest invalidation seen for its key.
    Fresh,

    /// A newer invalidation was seen, or a refresh is pending or in flight.
    Stale,

    /// Refreshing has failed repeatedly; the entry may be arbitrarily old.
    Degraded {
        /// Number of refresh attempts that failed in a row.
        consecutive_failures: u32,
    },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// A cached entry together with its freshness flag.
#[derive(Debug, Clone)]
pub struct CacheView {
    entry: CacheEntry,
    freshness: Freshness,
}

impl CacheView {
    pub fn new(entry: CacheEntry, freshness: Freshness) -> Self {
        Self { entry, freshness }
    }

    pub fn payload(&self) -> &Payload {
        &self.entry.payload
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Consume the view and return the underlying entry.
    pub fn into_entry(self) -> CacheEntry {
        self.entry
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness.is_fresh()
    }

    pub fn sequence(&self) -> Sequence {
        self.entry.last_synced_sequence
    }

    pub fn stored_at(&self) -> Timestamp {
        self.entry.stored_at
    }

    /// Time elapsed since the entry was written.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.entry.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
