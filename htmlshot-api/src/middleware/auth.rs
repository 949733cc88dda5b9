//! Bearer Authentication Middleware
//!
//! Authenticates API keys against the local [`AuthReplica`]. The replica
//! answers from LMDB without touching the network, so authentication adds no
//! origin round trip to the mint path.
//!
//! Keys are accepted as `Authorization: Bearer <key>` or `X-API-Key: <key>`.
//! On success the [`Authorized`] record is inserted into the request
//! extensions for [`AuthExtractor`].

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use htmlshot_core::AuthError;
use htmlshot_storage::{AuthReplica, Authorized};

use crate::error::ApiError;
use crate::telemetry::METRICS;

// ============================================================================
// TOKEN EXTRACTION
// ============================================================================

/// Pull the API key out of the request headers.
///
/// `Authorization: Bearer` wins over `X-API-Key` when both are present.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let from_authorization = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    let from_api_key = || {
        headers
            .get("x-api-key")
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
    };

    from_authorization.or_else(from_api_key).map(str::to_string)
}

fn record_decision(outcome: &str) {
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_auth_decision(outcome);
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Authentication middleware backed by the auth replica.
///
/// Rejects with `UNAUTHORIZED` when no key is supplied, `NOT_READY` before
/// the first snapshot, and `INVALID_KEY` / `KEY_INACTIVE` / `QUOTA_EXCEEDED`
/// according to the replicated facts.
pub async fn auth_middleware(
    State(replica): State<Arc<AuthReplica>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = bearer_token(request.headers()) else {
        record_decision("missing");
        return Err(AuthError::MissingCredentials.into());
    };

    match replica.authorize(&token) {
        Ok(authorized) => {
            record_decision("allowed");
            tracing::debug!(
                user_id = %authorized.user_id,
                plan = %authorized.plan,
                remaining = authorized.remaining,
                "Request authorized"
            );
            request.extensions_mut().insert(authorized);
            Ok(next.run(request).await)
        }
        Err(denial) => {
            record_decision(denial.code());
            if denial.is_retryable() {
                tracing::warn!("Auth replica not ready; refusing bearer request");
            } else {
                tracing::debug!(code = denial.code(), "Request denied");
            }
            Err(AuthError::from(denial).into())
        }
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// Typed extractor for the caller authorized by [`auth_middleware`].
///
/// Returns `500` if the middleware was not applied to the route.
#[derive(Debug, Clone)]
pub struct AuthExtractor(pub Authorized);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthExtractor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Authorized>()
            .cloned()
            .map(AuthExtractor)
            .ok_or_else(|| {
                ApiError::internal_error(
                    "Authorized caller not found in request extensions. \
                     Ensure auth_middleware is applied to this route.",
                )
            })
    }
}

impl std::ops::Deref for AuthExtractor {
    type Target = Authorized;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, ErrorCode};
    use axum::{
        body::Body,
        http::{header, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use htmlshot_test_utils::fixtures::{snapshot_for, TEST_API_KEY, TEST_USER};
    use tower::ServiceExt;

    fn test_app(replica: Arc<AuthReplica>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|AuthExtractor(auth): AuthExtractor| async move { auth.user_id }),
            )
            .layer(middleware::from_fn_with_state(replica, auth_middleware))
    }

    fn open_replica(dir: &tempfile::TempDir) -> Result<Arc<AuthReplica>, String> {
        AuthReplica::open(dir.path(), 16)
            .map(Arc::new)
            .map_err(|e| e.to_string())
    }

    async fn error_code(response: Response) -> Result<ErrorCode, String> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| e.to_string())?;
        let error: ApiError = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        Ok(error.code)
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("x-api-key", "hs_key".parse().expect("valid header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("hs_key"));

        headers.insert(
            header::AUTHORIZATION,
            "Bearer hs_bearer".parse().expect("valid header"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("hs_bearer"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().expect("valid header"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("hs_key"));
    }

    #[tokio::test]
    async fn test_missing_credentials_unauthorized() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let app = test_app(open_replica(&dir)?);

        let request = Request::builder()
            .uri("/protected")
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await?, ErrorCode::Unauthorized);
        Ok(())
    }

    #[tokio::test]
    async fn test_not_ready_before_first_snapshot() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let app = test_app(open_replica(&dir)?);

        let request = Request::builder()
            .uri("/protected")
            .header("authorization", format!("Bearer {}", TEST_API_KEY))
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await?, ErrorCode::NotReady);
        Ok(())
    }

    #[tokio::test]
    async fn test_valid_key_reaches_handler() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let replica = open_replica(&dir)?;
        replica
            .apply_snapshot(&snapshot_for(TEST_API_KEY, TEST_USER, 100, 0))
            .map_err(|e| e.to_string())?;
        let app = test_app(replica);

        let request = Request::builder()
            .uri("/protected")
            .header("x-api-key", TEST_API_KEY)
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| e.to_string())?;
        assert_eq!(&body[..], TEST_USER.as_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let replica = open_replica(&dir)?;
        replica
            .apply_snapshot(&snapshot_for(TEST_API_KEY, TEST_USER, 100, 0))
            .map_err(|e| e.to_string())?;
        let app = test_app(replica);

        let request = Request::builder()
            .uri("/protected")
            .header("authorization", "Bearer hs_not_a_key")
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await?, ErrorCode::InvalidKey);
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_boundary() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let replica = open_replica(&dir)?;
        let app = test_app(replica.clone());

        replica
            .apply_snapshot(&snapshot_for(TEST_API_KEY, TEST_USER, 100, 99))
            .map_err(|e| e.to_string())?;
        let request = Request::builder()
            .uri("/protected")
            .header("x-api-key", TEST_API_KEY)
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.clone().oneshot(request).await.map_err(|e| e.to_string())?;
        assert_eq!(response.status(), StatusCode::OK);

        replica
            .apply_snapshot(&snapshot_for(TEST_API_KEY, TEST_USER, 100, 100))
            .map_err(|e| e.to_string())?;
        let request = Request::builder()
            .uri("/protected")
            .header("x-api-key", TEST_API_KEY)
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = app.oneshot(request).await.map_err(|e| e.to_string())?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_code(response).await?, ErrorCode::QuotaExceeded);
        Ok(())
    }
}
