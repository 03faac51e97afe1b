//! Synthesis requests.
//!
//! A request for (document, block, model, voice) is answered from the cache
//! when the content key is already stored, joined to the outstanding job when
//! one exists, and enqueued otherwise.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use lectern_core::{
    BlockIndex, BlockStatus, ContentKey, DocumentId, JobId, JobKey, StatusEvent, SynthesisJob,
    SynthesisParams, UserId, ValidationError,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::queue::EnqueueOutcome;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    /// Omitted means the model's default voice.
    #[serde(default)]
    pub voice_slug: Option<String>,
    pub user_id: UserId,
    #[serde(default)]
    pub params: SynthesisParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResponse {
    pub status: BlockStatus,
    pub content_key: ContentKey,
    pub voice_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// POST /api/v1/synthesis
pub async fn request_synthesis(
    State(state): State<AppState>,
    Json(req): Json<SynthesisRequest>,
) -> ApiResult<(StatusCode, Json<SynthesisResponse>)> {
    let voice_slug = state
        .catalog
        .resolve_voice(&req.model_slug, req.voice_slug.as_deref())?;
    let model = state.catalog.validate_pair(&req.model_slug, &voice_slug)?;

    let text = state
        .documents
        .block_text(req.document_id, req.block_idx)
        .ok_or_else(|| ApiError::document_not_found(req.document_id))??;

    let chars = text.chars().count();
    if chars > model.max_block_chars {
        return Err(ValidationError::InvalidValue {
            field: "block_idx".to_string(),
            reason: format!(
                "block has {} characters, model {} accepts at most {}",
                chars, model.slug, model.max_block_chars
            ),
        }
        .into());
    }

    let key = JobKey::new(req.document_id, req.block_idx, &model.slug, &voice_slug);
    let job = SynthesisJob::new(req.user_id, &key, text, req.params);

    if state.store.contains(&job.content_key).await? {
        tracing::debug!(
            document_id = %key.document_id,
            block_idx = key.block_idx,
            content_key = %job.content_key,
            "Served from cache"
        );
        state
            .notifier
            .publish(key.document_id, StatusEvent::cached(&key, job.content_key.clone()));
        return Ok((
            StatusCode::OK,
            Json(SynthesisResponse {
                status: BlockStatus::Cached,
                content_key: job.content_key,
                voice_slug: key.voice_slug,
                job_id: None,
            }),
        ));
    }

    let response = match state.jobs.enqueue(job)? {
        EnqueueOutcome::Enqueued(job) => {
            state.notifier.publish(
                key.document_id,
                StatusEvent::new(&key, BlockStatus::Queued).with_job(job.job_id),
            );
            tracing::info!(
                job_id = %job.job_id,
                queue = %job.queue,
                block_idx = key.block_idx,
                "Synthesis queued"
            );
            SynthesisResponse {
                status: BlockStatus::Queued,
                content_key: job.content_key,
                voice_slug: key.voice_slug,
                job_id: Some(job.job_id),
            }
        }
        EnqueueOutcome::AlreadyOutstanding {
            job_id,
            status,
            content_key,
        } => SynthesisResponse {
            status,
            content_key,
            voice_slug: key.voice_slug,
            job_id: Some(job_id),
        },
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", post(request_synthesis))
}
