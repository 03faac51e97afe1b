//! Health Check Endpoints
//!
//! - /health/ping - Simple liveness check
//! - /health/billing - Billing drain backlog and batch timing
//!
//! No authentication required for health endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::jobs::BillingDrainSnapshot;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BillingHealth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingHealth {
    pub queue_depth: usize,
    pub in_flight: usize,
    #[serde(flatten)]
    pub drain: BillingDrainSnapshot,
    pub uptime_seconds: u64,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple liveness check
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/billing - Cold path health
///
/// Degraded when the backlog passes the configured depth or the last batch
/// had failures. Billing lag never makes the service unavailable, so this
/// always answers 200.
pub async fn billing(State(state): State<AppState>) -> impl IntoResponse {
    let drain = state.billing_metrics.snapshot();
    let queue_depth = state.billing.depth();

    let (status, message) = if drain.consecutive_failed_batches > 0 {
        (
            HealthStatus::Degraded,
            Some(format!(
                "{} consecutive batches with ledger failures",
                drain.consecutive_failed_batches
            )),
        )
    } else if queue_depth > state.billing_config.degraded_depth {
        (
            HealthStatus::Degraded,
            Some(format!("billing backlog at {} events", queue_depth)),
        )
    } else {
        (HealthStatus::Healthy, None)
    };

    let response = HealthResponse {
        status,
        message,
        details: Some(BillingHealth {
            queue_depth,
            in_flight: state.billing.in_flight(),
            drain,
            uptime_seconds: state.started_at.elapsed().as_secs(),
        }),
    };
    (StatusCode::OK, Json(response))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router (no auth required)
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/billing", get(billing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_serialization() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded)?, "\"degraded\"");
        let response = HealthResponse {
            status: HealthStatus::Healthy,
            message: None,
            details: None,
        };
        let json = serde_json::to_value(&response)?;
        assert_eq!(json, serde_json::json!({ "status": "healthy" }));
        Ok(())
    }
}
