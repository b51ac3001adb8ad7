//! Resource REST Routes
//!
//! `GET` and `PUT` a single resource of the backing store. Every successful
//! `PUT` produces exactly one invalidation for the key.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use freshet_core::{Payload, ResourceKey, ResourceStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Body returned by both handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub resource_key: ResourceKey,
    pub payload: Payload,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /api/v1/resources/:key
pub async fn get_resource(
    State(store): State<Arc<dyn ResourceStore>>,
    Path(key): Path<String>,
) -> ApiResult<Json<ResourceResponse>> {
    let resource_key = ResourceKey::new(key)?;
    let payload = store.read(&resource_key).await?;
    Ok(Json(ResourceResponse {
        resource_key,
        payload,
    }))
}

/// PUT /api/v1/resources/:key
pub async fn put_resource(
    State(store): State<Arc<dyn ResourceStore>>,
    Path(key): Path<String>,
    Json(payload): Json<Payload>,
) -> ApiResult<Json<ResourceResponse>> {
    let resource_key = ResourceKey::new(key)?;
    let payload = store.write(&resource_key, payload).await?;
    debug!(resource_key = %resource_key, "Resource replaced");
    Ok(Json(ResourceResponse {
        resource_key,
        payload,
    }))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new().route("/:key", get(get_resource).put(put_resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_response_shape() -> Result<(), serde_json::Error> {
        let response = ResourceResponse {
            resource_key: ResourceKey::new("U1").expect("valid key"),
            payload: json!({ "name": "a" }),
        };
        let value = serde_json::to_value(&response)?;
        assert_eq!(value, json!({ "resource_key": "U1", "payload": { "name": "a" } }));
        Ok(())
    }
}
