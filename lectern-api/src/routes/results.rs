//! Worker result ingestion.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use lectern_core::{JobId, SynthesisResult};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAccepted {
    pub job_id: JobId,
}

/// POST /api/v1/results
///
/// Hands the result to the consumer pool and returns without waiting for the
/// cache write.
pub async fn submit_result(
    State(state): State<AppState>,
    Json(result): Json<SynthesisResult>,
) -> ApiResult<(StatusCode, Json<ResultAccepted>)> {
    let job_id = result.job_id;
    state.results.send(result).await.map_err(|_| {
        tracing::error!(job_id = %job_id, "Result consumer pool is gone");
        ApiError::service_unavailable("Result consumer is not running")
    })?;
    Ok((StatusCode::ACCEPTED, Json(ResultAccepted { job_id })))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", post(submit_result))
}
