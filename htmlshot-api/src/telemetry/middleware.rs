//! Axum Middleware for HTTP Request Metrics
//!
//! Records every request in Prometheus and emits one structured log line per
//! response. Paths are labelled by their matched route so query strings and
//! unknown paths cannot blow up label cardinality.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info_span, Instrument};

use super::metrics::METRICS;

/// Route label for a request. Unrouted requests share one label.
fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
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

    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_http_request(
            method.as_str(),
            &route,
            status.as_u16(),
            duration.as_secs_f64(),
        );
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
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_routed_request_passes_through() -> Result<(), String> {
        let app = Router::new()
            .route("/probe/:id", get(|| async { "ok" }))
            .layer(middleware::from_fn(observability_middleware));

        let request = Request::builder()
            .uri("/probe/42")
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;
        assert_eq!(response.status(), StatusCode::OK);

        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        let count = metrics
            .http_requests_total
            .with_label_values(&["GET", "/probe/:id", "200"])
            .get();
        assert!(count >= 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unrouted_request_uses_shared_label() -> Result<(), String> {
        let app = Router::new()
            .route("/probe", get(|| async { "ok" }))
            .layer(middleware::from_fn(observability_middleware));

        let request = Request::builder()
            .uri("/nowhere/123")
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}
