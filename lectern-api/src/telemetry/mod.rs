//! LECTERN Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and Prometheus metrics for the
//! server, the hot path and the billing drain.

pub mod metrics;
pub mod middleware;
pub mod tracer;

pub use metrics::{metrics, metrics_handler, LecternMetrics, METRICS};
pub use middleware::observability_middleware;
pub use tracer::{init_tracing, TelemetryConfig};
