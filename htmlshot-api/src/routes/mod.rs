//! REST API Routes
//!
//! | Route                 | Auth        | Notes                              |
//! |-----------------------|-------------|------------------------------------|
//! | `GET /v1/image`       | URL `sig`   | Cacheable image bytes              |
//! | `POST /v1/image/mint` | Bearer key  | Bounded by the mint timeout        |
//! | `GET /metrics`        | none        | Prometheus text format             |
//! | `GET /health/*`       | none        | ping, live, ready                  |

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    BoxError, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::timeout::{error::Elapsed, TimeoutLayer};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::constants::RENDER_CACHED_HEADER;
use crate::error::ApiError;
use crate::middleware::auth_middleware;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

pub mod health;
pub mod image;

const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::IF_NONE_MATCH,
            HeaderName::from_static("x-api-key"),
        ])
        .expose_headers([
            header::ETAG,
            header::CACHE_CONTROL,
            HeaderName::from_static(RENDER_CACHED_HEADER),
            HeaderName::from_static("server-timing"),
        ])
        .max_age(CORS_MAX_AGE);

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!("CORS: allowing origins: {:?}", config.cors_origins);
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

async fn handle_mint_timeout(err: BoxError) -> ApiError {
    if err.is::<Elapsed>() {
        ApiError::request_timeout("mint")
    } else {
        tracing::error!(error = %err, "Mint middleware failed");
        ApiError::internal_error("Mint request failed")
    }
}

/// Create the complete API router.
pub fn create_api_router(state: AppState, config: &ServerConfig) -> Router {
    let mint = post(image::mint_image)
        .route_layer(from_fn_with_state(state.replica.clone(), auth_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_mint_timeout))
                .layer(TimeoutLayer::new(config.mint_timeout)),
        );

    Router::new()
        .route("/v1/image", get(image::serve_image))
        .route("/v1/image/mint", mint)
        .route("/metrics", get(metrics_handler))
        .nest("/health", health::create_router(&state))
        .layer(from_fn(observability_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(GlobalConcurrencyLimitLayer::new(config.max_in_flight))
        .layer(build_cors_layer(config))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_mint_timeout_maps_to_request_timeout() {
        let err = handle_mint_timeout(Box::new(Elapsed::new())).await;
        assert_eq!(err.code, ErrorCode::RequestTimeout);

        let err = handle_mint_timeout("boom".into()).await;
        assert_eq!(err.code, ErrorCode::InternalError);
    }
}
