//! Prometheus Metrics Definitions
//!
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_gauge, CounterVec, Encoder,
    IntCounter, IntGauge, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// Global metrics instance - initialized once on first use
pub static METRICS: Lazy<ApiResult<FreshetMetrics>> = Lazy::new(FreshetMetrics::new);

/// Container for all server metrics.
#[derive(Clone)]
pub struct FreshetMetrics {
    /// Currently registered WebSocket sessions
    pub sessions: IntGauge,

    /// Invalidation events emitted by the broadcaster
    pub invalidations_total: IntCounter,

    /// Per-session delivery attempts - labels: outcome (delivered/dropped)
    pub deliveries_total: CounterVec,

    /// Sessions removed because their queue was full or closed
    pub sessions_dropped_total: IntCounter,

    /// Writes applied through the notifying store - labels: status
    pub resource_writes_total: CounterVec,
}

impl FreshetMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            sessions: register_int_gauge!(
                "freshet_sessions",
                "Current number of registered WebSocket sessions"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register sessions: {}", e)))?,

            invalidations_total: register_int_counter!(
                "freshet_invalidations_total",
                "Total invalidation events emitted"
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register invalidations_total: {}", e))
            })?,

            deliveries_total: register_counter_vec!(
                "freshet_deliveries_total",
                "Invalidation deliveries to sessions",
                &["outcome"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register deliveries_total: {}", e))
            })?,

            sessions_dropped_total: register_int_counter!(
                "freshet_sessions_dropped_total",
                "Sessions dropped after a failed delivery"
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register sessions_dropped_total: {}", e))
            })?,

            resource_writes_total: register_counter_vec!(
                "freshet_resource_writes_total",
                "Writes applied through the notifying store",
                &["status"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register resource_writes_total: {}", e))
            })?,
        })
    }
}

/// Run `f` against the global metrics if they registered successfully.
pub fn record(f: impl FnOnce(&FreshetMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Handler for `GET /metrics`.
pub async fn metrics_handler() -> impl IntoResponse {
    // Register on first scrape even if nothing recorded yet
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            ApiError::internal_error(format!("Failed to encode metrics: {}", e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        assert!(METRICS.as_ref().is_ok());
        record(|m| m.invalidations_total.inc());
        record(|m| assert!(m.invalidations_total.get() >= 1));
    }
}
