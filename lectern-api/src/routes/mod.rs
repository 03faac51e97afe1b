//! REST API Route Handlers
//!
//! Each submodule exposes `create_router()` returning a `Router<AppState>`;
//! [`create_api_router`] nests them and applies the shared layers.

pub mod cache;
pub mod documents;
pub mod health;
pub mod models;
pub mod queues;
pub mod results;
pub mod synthesis;

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};
use crate::ws::ws_handler;

/// Build the complete application router.
pub fn create_api_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .nest("/documents", documents::create_router())
        .nest("/synthesis", synthesis::create_router())
        .nest("/cache", cache::create_router())
        .nest("/models", models::create_router())
        .nest("/results", results::create_router())
        .nest("/queues", queues::create_router());

    Router::new()
        .nest("/api/v1", api)
        .nest("/health", health::create_router())
        .route("/ws/documents/:document_id", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(from_fn(observability_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(config))
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer.
///
/// In development mode (empty origins), allows all origins.
/// In production mode, only allows configured origins.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(
            "CORS: Production mode - allowing origins: {:?}",
            config.cors_origins
        );
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(origins)
    }
}
