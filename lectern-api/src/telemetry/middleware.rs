//! Axum Middleware for HTTP Request Tracing and Metrics
//!
//! Every request gets a tracing span and a Prometheus sample. Metrics are
//! labelled with the matched route template, never the raw path, so ids in
//! the URL do not blow up label cardinality.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info_span, Instrument};

use super::metrics::metrics;

const UNMATCHED_ROUTE: &str = "unmatched";

/// Route template for metrics labels.
fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

/// Observability middleware for Axum.
pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = route_label(&request);

    let span = info_span!(
        "http_request",
        http.method = %method,
        http.target = %path,
        http.route = %route,
    );

    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Some(m) = metrics() {
        m.record_http_request(method.as_str(), &route, status.as_u16(), duration.as_secs_f64());
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware::from_fn, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_middleware_passes_response_through() -> Result<(), Box<dyn std::error::Error>> {
        let app = Router::new()
            .route("/items/:id", get(|| async { "ok" }))
            .layer(from_fn(observability_middleware));

        let response = app
            .oneshot(Request::builder().uri("/items/42").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[test]
    fn test_unmatched_route_label() -> Result<(), axum::http::Error> {
        let request = Request::builder().uri("/nowhere/123").body(axum::body::Body::empty())?;
        assert_eq!(route_label(&request), UNMATCHED_ROUTE);
        Ok(())
    }
}
