//! Document registration.
//!
//! Extraction and block splitting happen upstream; clients post the ordered
//! block texts here and receive the id used everywhere else.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lectern_core::DocumentId;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDocumentRequest {
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub document_id: DocumentId,
    pub block_count: usize,
}

/// POST /api/v1/documents
pub async fn register_document(
    State(state): State<AppState>,
    Json(req): Json<RegisterDocumentRequest>,
) -> ApiResult<(StatusCode, Json<DocumentResponse>)> {
    let block_count = req.blocks.len();
    let document_id = state.documents.register(req.blocks)?;
    tracing::info!(document_id = %document_id, block_count, "Document registered");
    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse {
            document_id,
            block_count,
        }),
    ))
}

/// GET /api/v1/documents/:document_id
pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> ApiResult<Json<DocumentResponse>> {
    let block_count = state
        .documents
        .block_count(document_id)
        .ok_or_else(|| ApiError::document_not_found(document_id))?;
    Ok(Json(DocumentResponse {
        document_id,
        block_count,
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(register_document))
        .route("/:document_id", get(get_document))
}
