//! Error types for htmlshot operations

use thiserror::Error;

/// Request validation errors. Raised before any side effect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Field {field} must be between {min} and {max}")]
    OutOfRange { field: String, min: u64, max: u64 },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Duplicate parameter: {name}")]
    DuplicateParameter { name: String },
}

/// Signed URL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature is missing")]
    Missing,

    #[error("Signature does not match request parameters")]
    Invalid,

    #[error("Signed URL expired at {expired_at}")]
    Expired { expired_at: i64 },
}

/// Authorization errors. `NotReady` is retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingCredentials,

    #[error("Authorization data is not loaded yet")]
    NotReady,

    #[error("API key is not recognised")]
    InvalidKey,

    #[error("API key is disabled")]
    KeyInactive,

    #[error("Monthly quota exceeded ({current_usage}/{monthly_limit})")]
    QuotaExceeded {
        current_usage: u64,
        monthly_limit: u64,
    },

    #[error("Subscription is {status}")]
    SubscriptionInactive { status: String },
}

/// Template resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Template not found: {id}")]
    TemplateNotFound { id: String },

    #[error("Missing required variables: {}", names.join(", "))]
    MissingVariables { names: Vec<String> },
}

/// Render errors surfaced after the recovery cascade is exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Render timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Render failed: {message}")]
    Failed { message: String },

    #[error("Renderer unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Storage layer errors (cache tiers and replica).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O failure: {reason}")]
    Io { reason: String },

    #[error("Database failure: {reason}")]
    Database { reason: String },

    #[error("Corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Failures talking to the origin service collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Upstream request failed: {reason}")]
    Request { reason: String },

    #[error("Upstream returned status {status}")]
    Status { status: u16 },

    #[error("Malformed upstream response: {reason}")]
    Decode { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all htmlshot errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HtmlshotError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for htmlshot operations.
pub type HtmlshotResult<T> = Result<T, HtmlshotError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_out_of_range() {
        let err = ValidationError::OutOfRange {
            field: "width".to_string(),
            min: 1,
            max: 4096,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("width"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_missing_variables_lists_every_name() {
        let err = ResolutionError::MissingVariables {
            names: vec!["title".to_string(), "author".to_string()],
        };
        assert_eq!(
            format!("{}", err),
            "Missing required variables: title, author"
        );
    }

    #[test]
    fn test_quota_error_display() {
        let err = AuthError::QuotaExceeded {
            current_usage: 100,
            monthly_limit: 100,
        };
        assert!(format!("{}", err).contains("100/100"));
    }

    #[test]
    fn test_from_conversions() {
        let err: HtmlshotError = SignatureError::Invalid.into();
        assert!(matches!(err, HtmlshotError::Signature(SignatureError::Invalid)));

        let err: HtmlshotError = RenderError::Timeout { timeout_ms: 10 }.into();
        assert!(format!("{}", err).contains("10ms"));
    }
}
