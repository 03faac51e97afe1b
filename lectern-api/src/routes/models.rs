//! Model catalog.

use axum::{extract::State, routing::get, Json, Router};
use lectern_core::ModelCatalog;

use crate::state::AppState;

/// GET /api/v1/models
///
/// Clients build their model and voice pickers from this; nothing about a
/// model's capabilities is hard-coded on their side.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelCatalog> {
    Json(state.catalog.as_ref().clone())
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", get(list_models))
}
