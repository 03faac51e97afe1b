//! Prometheus Metrics Definitions
//!
//! Defines all LECTERN metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Store+notify latency buckets (seconds). The hot path should stay in the
/// low milliseconds.
const HOT_PATH_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0,
];

/// Billing batch latency buckets (seconds)
const BILLING_BATCH_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<LecternMetrics>> = Lazy::new(LecternMetrics::new);

/// The global metrics, if registration succeeded.
pub fn metrics() -> Option<&'static LecternMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all LECTERN metrics.
#[derive(Clone)]
pub struct LecternMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Result consumer store+notify duration
    pub hot_path_duration_seconds: Histogram,

    /// Consumed results - labels: outcome (cached, worker_error, storage_error, duplicate)
    pub results_total: CounterVec,

    /// Billing events waiting to be applied
    pub billing_queue_depth: Gauge,

    /// Duration of one billing drain batch
    pub billing_batch_duration_seconds: Histogram,

    /// Billing events by result - labels: status (applied, duplicate, retried)
    pub billing_events_total: CounterVec,

    /// Current active WebSocket connections
    pub websocket_connections: Gauge,
}

impl LecternMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "lectern_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_requests_total: {}", e)))?,

            http_request_duration_seconds: register_histogram_vec!(
                "lectern_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_request_duration_seconds: {}", e)))?,

            hot_path_duration_seconds: register_histogram!(
                "lectern_hot_path_duration_seconds",
                "Time from result arrival to cache write and status publish",
                HOT_PATH_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register hot_path_duration_seconds: {}", e)))?,

            results_total: register_counter_vec!(
                "lectern_results_total",
                "Worker results consumed",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register results_total: {}", e)))?,

            billing_queue_depth: register_gauge!(
                "lectern_billing_queue_depth",
                "Billing events waiting to be applied"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register billing_queue_depth: {}", e)))?,

            billing_batch_duration_seconds: register_histogram!(
                "lectern_billing_batch_duration_seconds",
                "Duration of one billing drain batch",
                BILLING_BATCH_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register billing_batch_duration_seconds: {}", e)))?,

            billing_events_total: register_counter_vec!(
                "lectern_billing_events_total",
                "Billing events by result",
                &["status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register billing_events_total: {}", e)))?,

            websocket_connections: register_gauge!(
                "lectern_websocket_connections",
                "Current number of active WebSocket connections"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register websocket_connections: {}", e)))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record one consumed result.
    pub fn record_result(&self, outcome: &str, duration_secs: f64) {
        self.results_total.with_label_values(&[outcome]).inc();
        self.hot_path_duration_seconds.observe(duration_secs);
    }

    /// Record one billing drain batch.
    pub fn record_billing_batch(&self, applied: u64, duplicates: u64, retried: u64, duration_secs: f64) {
        self.billing_events_total
            .with_label_values(&["applied"])
            .inc_by(applied as f64);
        self.billing_events_total
            .with_label_values(&["duplicate"])
            .inc_by(duplicates as f64);
        self.billing_events_total
            .with_label_values(&["retried"])
            .inc_by(retried as f64);
        self.billing_batch_duration_seconds.observe(duration_secs);
    }

    pub fn set_billing_queue_depth(&self, depth: usize) {
        self.billing_queue_depth.set(depth as f64);
    }

    /// Increment WebSocket connection count.
    pub fn ws_connected(&self) {
        self.websocket_connections.inc();
    }

    /// Decrement WebSocket connection count.
    pub fn ws_disconnected(&self) {
        self.websocket_connections.dec();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
