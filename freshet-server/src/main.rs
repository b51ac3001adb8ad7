//! freshet Server Entry Point
//!
//! Reads configuration from the environment and serves the router until
//! Ctrl-C.

use std::sync::Arc;

use freshet_server::telemetry::{init_tracing, TelemetryConfig};
use freshet_server::{
    create_router, ApiError, ApiResult, AppState, ChangeBroadcaster, InMemoryResourceStore,
    ServerConfig,
};

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = ServerConfig::from_env()
        .map_err(|e| ApiError::invalid_input(format!("Invalid configuration: {}", e)))?;
    let addr = config
        .bind_addr()
        .map_err(|e| ApiError::invalid_input(e.to_string()))?;

    let broadcaster_config = config.broadcaster_config();
    tracing::info!(
        sequence_floor = %broadcaster_config.sequence_floor,
        session_queue_capacity = broadcaster_config.session_queue_capacity,
        max_sessions = ?broadcaster_config.max_sessions,
        "Broadcaster configured"
    );
    let broadcaster = Arc::new(ChangeBroadcaster::new(broadcaster_config));
    let state = AppState::new(InMemoryResourceStore::new(), broadcaster.clone());
    let app = create_router(state, &config);

    tracing::info!(%addr, "Starting freshet server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let dropped = broadcaster.disconnect_all();
    tracing::info!(sessions = dropped, "freshet server stopped");

    Ok(())
}
