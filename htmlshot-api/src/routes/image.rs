//! Image Endpoints
//!
//! - `GET /v1/image` serves a signed image URL. No bearer key; the URL
//!   signature is the credential.
//! - `POST /v1/image/mint` issues a signed URL for an authorized caller.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, RawQuery, State},
    http::{header, HeaderMap},
    Json,
};

use crate::error::{ApiError, ApiResult};
use crate::middleware::AuthExtractor;
use crate::services::{ImageService, MintRequest, MintResponse, ServeOutcome};

/// GET /v1/image - Serve a signed image
pub async fn serve_image(
    State(images): State<Arc<ImageService>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> ApiResult<ServeOutcome> {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());
    images.serve(query.as_deref(), if_none_match).await
}

/// POST /v1/image/mint - Mint a signed image URL
pub async fn mint_image(
    State(images): State<Arc<ImageService>>,
    AuthExtractor(auth): AuthExtractor,
    payload: Result<Json<MintRequest>, JsonRejection>,
) -> ApiResult<Json<MintResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::invalid_params(rejection.body_text()))?;
    let response = images.mint(&auth, request).await?;
    Ok(Json(response))
}
