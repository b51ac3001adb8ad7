//! Resource Access Facade.
//!
//! The backing store is an external collaborator. freshet only needs to
//! read the current value of a resource and, on the server, to apply a
//! write and learn that it succeeded.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AccessError;
use crate::key::ResourceKey;
use crate::Payload;

/// Read side of the backing store.
///
/// Implementations own their own timeout policy; the synchronizer never
/// cancels a read once it started.
#[async_trait]
pub trait ResourceAccess: Send + Sync {
    /// Fetch the current value of a resource.
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError>;
}

/// Write side of the backing store.
///
/// Every successful `write` must eventually produce exactly one change
/// notification for `key`. The server's notifying wrapper is the usual way
/// to satisfy that.
#[async_trait]
pub trait ResourceStore: ResourceAccess {
    /// Replace the value of a resource, returning the stored value.
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError>;
}

#[async_trait]
impl<T: ResourceAccess + ?Sized> ResourceAccess for Arc<T> {
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError> {
        (**self).read(key).await
    }
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError> {
        (**self).write(key, payload).await
    }
}
