//! Local cache store for freshet clients.
//!
//! Holds the last-known-good snapshot of every resource a client renders,
//! together with the sequence of the invalidation it answers. The Cache
//! Synchronizer is the only writer; the render layer reads through it.
//!
//! # Example
//!
//! ```ignore
//! let store = LmdbCacheStore::open(&config.cache.path, config.cache.max_size_mb)?;
//! if let Some(entry) = store.get(&key).await? {
//!     render(&entry.payload);
//! }
//! ```

pub mod entry;
pub mod freshness;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use entry::CacheEntry;
pub use freshness::{CacheView, Freshness};
pub use lmdb_backend::{LmdbCacheError, LmdbCacheStore};
pub use memory::InMemoryCacheStore;
pub use traits::{CacheStats, LocalCacheStore};
