//! Worker pull endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lectern_core::{BlockStatus, StatusEvent};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDepthResponse {
    pub queue: String,
    pub depth: usize,
}

/// GET /api/v1/queues/:queue/next
///
/// 200 with the job, 204 when the queue is empty.
pub async fn next_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> ApiResult<Response> {
    match state.jobs.next(&queue)? {
        Some(job) => {
            let key = job.job_key();
            state.notifier.publish(
                key.document_id,
                StatusEvent::new(&key, BlockStatus::Processing).with_job(job.job_id),
            );
            tracing::debug!(job_id = %job.job_id, queue = %queue, "Job handed to worker");
            Ok((StatusCode::OK, Json(job)).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// GET /api/v1/queues/:queue
pub async fn queue_depth(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> ApiResult<Json<QueueDepthResponse>> {
    if !state.jobs.is_known(&queue) {
        return Err(ApiError::queue_not_found(&queue));
    }
    Ok(Json(QueueDepthResponse {
        depth: state.jobs.depth(&queue),
        queue,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/:queue", get(queue_depth))
        .route("/:queue/next", get(next_job))
}
