//! Server Telemetry
//!
//! Structured logging via `tracing-subscriber` and Prometheus metrics.

pub mod metrics;
pub mod tracer;

pub use metrics::{metrics_handler, record, FreshetMetrics, METRICS};
pub use tracer::{init_tracing, TelemetryConfig};
