//! Cached audio retrieval and cache maintenance.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lectern_core::ContentKey;
use lectern_storage::{CacheStats, EvictionReport};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Best-effort audio content type from magic bytes.
fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match bytes {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] | [0xFF, 0xF2, ..] => {
            "audio/mpeg"
        }
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        [b'f', b'L', b'a', b'C', ..] => "audio/flac",
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => "audio/mp4",
        [0x1A, 0x45, 0xDF, 0xA3, ..] => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// GET /api/v1/cache/:key
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> ApiResult<Response> {
    let key = ContentKey::parse(&raw_key)?;
    let bytes = state
        .store
        .retrieve(&key)
        .await?
        .ok_or_else(|| ApiError::artifact_not_found(&key))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, sniff_content_type(&bytes)),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        bytes,
    )
        .into_response())
}

/// HEAD /api/v1/cache/:key
pub async fn head_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = ContentKey::parse(&raw_key)?;
    if state.store.contains(&key).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinResponse {
    pub content_key: ContentKey,
    pub pinned: bool,
}

/// POST /api/v1/cache/:key/pin
pub async fn pin_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> ApiResult<Json<PinResponse>> {
    set_pinned(&state, &raw_key, true).await
}

/// DELETE /api/v1/cache/:key/pin
pub async fn unpin_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> ApiResult<Json<PinResponse>> {
    set_pinned(&state, &raw_key, false).await
}

async fn set_pinned(state: &AppState, raw_key: &str, pinned: bool) -> ApiResult<Json<PinResponse>> {
    let key = ContentKey::parse(raw_key)?;
    let found = if pinned {
        state.store.pin(&key).await?
    } else {
        state.store.unpin(&key).await?
    };
    if !found {
        return Err(ApiError::artifact_not_found(&key));
    }
    tracing::info!(content_key = %key, pinned, "Pin flag updated");
    Ok(Json(PinResponse {
        content_key: key,
        pinned,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictRequest {
    /// Evict unpinned entries until stored bytes are at most this.
    pub cap_bytes: u64,
}

/// POST /api/v1/cache/evict
pub async fn evict(
    State(state): State<AppState>,
    Json(req): Json<EvictRequest>,
) -> ApiResult<Json<EvictionReport>> {
    let report = state.store.evict_to(req.cap_bytes).await?;
    tracing::info!(
        cap_bytes = req.cap_bytes,
        evicted = report.evicted,
        freed_bytes = report.freed_bytes,
        "Manual eviction"
    );
    Ok(Json(report))
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
}

/// GET /api/v1/cache/stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<CacheStatsResponse>> {
    let stats = state.store.stats().await?;
    Ok(Json(CacheStatsResponse {
        hit_rate: stats.hit_rate(),
        stats,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/evict", post(evict))
        .route("/:key", get(get_artifact).head(head_artifact))
        .route("/:key/pin", post(pin_artifact).delete(unpin_artifact))
}
