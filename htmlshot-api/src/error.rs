//! Error Types for the htmlshot API
//!
//! This module defines error handling for the HTTP layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - Conversions from the domain error taxonomy in `htmlshot-core`
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use htmlshot_core::{
    AuthError, ConfigError, HtmlshotError, RenderError, ResolutionError, SignatureError,
    StorageError, UpstreamError, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code. Codes are serialized
/// in `SCREAMING_SNAKE_CASE` and form the public error contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// A parameter is malformed, unknown or duplicated
    InvalidParams,

    /// Required field is missing from request
    MissingField,

    /// Field value is out of valid range
    InvalidRange,

    /// Template requires variables the request did not provide
    MissingVariables,

    // ========================================================================
    // Signed URL Errors (403, 410)
    // ========================================================================
    /// Signature is missing or does not match the parameters
    InvalidSignature,

    /// Signature is valid but the URL is past its expiry
    UrlExpired,

    // ========================================================================
    // Authorization Errors (401, 403, 429, 503)
    // ========================================================================
    /// Request lacks credentials
    Unauthorized,

    /// API key is not recognised
    InvalidKey,

    /// API key exists but is disabled
    KeyInactive,

    /// Monthly quota exhausted or subscription inactive
    QuotaExceeded,

    /// Authorization data has not been loaded yet. Retryable.
    NotReady,

    // ========================================================================
    // Resolution Errors (404)
    // ========================================================================
    /// Template does not exist or is not visible to the caller
    TemplateNotFound,

    // ========================================================================
    // Render Errors (500, 504)
    // ========================================================================
    /// Every stage of the render cascade failed
    RenderFailed,

    /// The last render attempt timed out
    RenderTimeout,

    // ========================================================================
    // Server Errors
    // ========================================================================
    /// An origin collaborator failed
    UpstreamError,

    /// The request took longer than the route allows
    RequestTimeout,

    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidParams
            | ErrorCode::MissingField
            | ErrorCode::InvalidRange
            | ErrorCode::MissingVariables => StatusCode::BAD_REQUEST,

            ErrorCode::InvalidSignature => StatusCode::FORBIDDEN,
            ErrorCode::UrlExpired => StatusCode::GONE,

            ErrorCode::Unauthorized | ErrorCode::InvalidKey => StatusCode::UNAUTHORIZED,
            ErrorCode::KeyInactive => StatusCode::FORBIDDEN,
            ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NotReady => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::TemplateNotFound => StatusCode::NOT_FOUND,

            ErrorCode::RenderFailed | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::RenderTimeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams => "Invalid request parameters",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidRange => "Value is out of valid range",
            ErrorCode::MissingVariables => "Required template variables are missing",
            ErrorCode::InvalidSignature => "Invalid signature",
            ErrorCode::UrlExpired => "Signed URL has expired",
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::InvalidKey => "Invalid API key",
            ErrorCode::KeyInactive => "API key is disabled",
            ErrorCode::QuotaExceeded => "Monthly quota exceeded",
            ErrorCode::NotReady => "Service is warming up, retry shortly",
            ErrorCode::TemplateNotFound => "Template not found",
            ErrorCode::RenderFailed => "Render failed",
            ErrorCode::RenderTimeout => "Render timed out",
            ErrorCode::UpstreamError => "Upstream service failed",
            ErrorCode::RequestTimeout => "Request timed out",
            ErrorCode::InternalError => "Internal server error",
        }
    }

    /// Parse a wire code such as `QUOTA_EXCEEDED`.
    pub fn from_wire(code: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(code.to_string())).ok()
    }

    /// The `SCREAMING_SNAKE_CASE` form used on the wire.
    pub fn as_wire(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (missing variable names, quota state, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details: None,
        }
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_range(field: &str, min: impl fmt::Display, max: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidRange,
            format!("Field '{}' must be between {} and {}", field, min, max),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn template_not_found(template_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::TemplateNotFound,
            format!("Template {} not found", template_id),
        )
    }

    pub fn upstream_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamError, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn request_timeout(operation: &str) -> Self {
        Self::new(
            ErrorCode::RequestTimeout,
            format!("Operation '{}' timed out", operation),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

/// Implement IntoResponse for ApiError so handlers can return it directly.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self);
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN ERRORS
// ============================================================================

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let code = match &err {
            ValidationError::MissingField { .. } => ErrorCode::MissingField,
            ValidationError::OutOfRange { .. } => ErrorCode::InvalidRange,
            ValidationError::InvalidValue { .. }
            | ValidationError::UnknownParameter { .. }
            | ValidationError::DuplicateParameter { .. } => ErrorCode::InvalidParams,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Missing | SignatureError::Invalid => {
                ApiError::new(ErrorCode::InvalidSignature, err.to_string())
            }
            SignatureError::Expired { expired_at } => {
                ApiError::new(ErrorCode::UrlExpired, err.to_string())
                    .with_details(serde_json::json!({ "expiredAt": expired_at }))
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::MissingCredentials => ApiError::new(ErrorCode::Unauthorized, err.to_string()),
            AuthError::NotReady => ApiError::new(ErrorCode::NotReady, err.to_string()),
            AuthError::InvalidKey => ApiError::new(ErrorCode::InvalidKey, err.to_string()),
            AuthError::KeyInactive => ApiError::new(ErrorCode::KeyInactive, err.to_string()),
            AuthError::QuotaExceeded {
                current_usage,
                monthly_limit,
            } => ApiError::new(ErrorCode::QuotaExceeded, err.to_string()).with_details(
                serde_json::json!({
                    "currentUsage": current_usage,
                    "monthlyLimit": monthly_limit,
                }),
            ),
            AuthError::SubscriptionInactive { status } => {
                ApiError::new(ErrorCode::QuotaExceeded, err.to_string())
                    .with_details(serde_json::json!({ "subscriptionStatus": status }))
            }
        }
    }
}

impl From<ResolutionError> for ApiError {
    fn from(err: ResolutionError) -> Self {
        match &err {
            ResolutionError::TemplateNotFound { .. } => {
                ApiError::new(ErrorCode::TemplateNotFound, err.to_string())
            }
            ResolutionError::MissingVariables { names } => {
                ApiError::new(ErrorCode::MissingVariables, err.to_string())
                    .with_details(serde_json::json!({ "missing": names }))
            }
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        match &err {
            RenderError::Timeout { .. } => ApiError::new(ErrorCode::RenderTimeout, err.to_string()),
            RenderError::Failed { .. } | RenderError::Unavailable { .. } => {
                ApiError::new(ErrorCode::RenderFailed, err.to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "Storage error");
        ApiError::internal_error("Storage operation failed")
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        tracing::warn!(error = %err, "Upstream collaborator failed");
        ApiError::upstream_error(err.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::internal_error(err.to_string())
    }
}

impl From<HtmlshotError> for ApiError {
    fn from(err: HtmlshotError) -> Self {
        match err {
            HtmlshotError::Validation(e) => e.into(),
            HtmlshotError::Signature(e) => e.into(),
            HtmlshotError::Auth(e) => e.into(),
            HtmlshotError::Resolution(e) => e.into(),
            HtmlshotError::Render(e) => e.into(),
            HtmlshotError::Storage(e) => e.into(),
            HtmlshotError::Upstream(e) => e.into(),
            HtmlshotError::Config(e) => e.into(),
        }
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::InvalidParams.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::InvalidSignature.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::UrlExpired.status_code(), StatusCode::GONE);
        assert_eq!(ErrorCode::InvalidKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ErrorCode::QuotaExceeded.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::NotReady.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::TemplateNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::RenderTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::UpstreamError.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_wire_codes_round_trip() {
        assert_eq!(ErrorCode::UrlExpired.as_wire(), "URL_EXPIRED");
        assert_eq!(
            ErrorCode::from_wire("QUOTA_EXCEEDED"),
            Some(ErrorCode::QuotaExceeded)
        );
        assert_eq!(ErrorCode::from_wire("NOT_A_CODE"), None);
    }

    #[test]
    fn test_validation_mapping() {
        let err: ApiError = ValidationError::OutOfRange {
            field: "quality".to_string(),
            min: 1,
            max: 100,
        }
        .into();
        assert_eq!(err.code, ErrorCode::InvalidRange);

        let err: ApiError = ValidationError::DuplicateParameter {
            name: "uid".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[test]
    fn test_signature_mapping() {
        let err: ApiError = SignatureError::Missing.into();
        assert_eq!(err.code, ErrorCode::InvalidSignature);

        let err: ApiError = SignatureError::Expired { expired_at: 10 }.into();
        assert_eq!(err.code, ErrorCode::UrlExpired);
        assert_eq!(err.details, Some(serde_json::json!({ "expiredAt": 10 })));
    }

    #[test]
    fn test_missing_variables_carry_names() {
        let err: ApiError = HtmlshotError::from(ResolutionError::MissingVariables {
            names: vec!["title".to_string()],
        })
        .into();
        assert_eq!(err.code, ErrorCode::MissingVariables);
        assert_eq!(err.details, Some(serde_json::json!({ "missing": ["title"] })));
    }

    #[test]
    fn test_subscription_inactive_is_quota_exceeded() {
        let err: ApiError = AuthError::SubscriptionInactive {
            status: "unpaid".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::from_code(ErrorCode::NotReady);
        let json = serde_json::to_string(&err)?;

        assert!(json.contains("NOT_READY"));
        assert!(!json.contains("details"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::upstream_error("template service down");
        let display = format!("{}", err);
        assert!(display.contains("UpstreamError"));
        assert!(display.contains("template service down"));
    }
}
