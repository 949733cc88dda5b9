//! Error types for the render pipeline.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Failure class reported by (or inferred from) the compositor.
///
/// The executor's recovery cascade branches on this: `Style` failures get a
/// stricter sanitization pass, everything else goes straight to the
/// font-less retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Style,
    Resource,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Style => "style",
            FailureKind::Resource => "resource",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed compositor invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct CompositorError {
    pub kind: FailureKind,
    pub message: String,
}

impl CompositorError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build from an untyped message, inferring the kind.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn is_style(&self) -> bool {
        self.kind == FailureKind::Style
    }
}

const STYLE_PATTERNS: &[&str] = &[
    "unsupported",
    "invalid value",
    "invalid css",
    "css parse",
    "invalid style",
    "style error",
    "display",
    "unknown property",
    "unexpected token",
    "cannot parse",
];

const RESOURCE_PATTERNS: &[&str] = &[
    "font",
    "fetch",
    "network",
    "download",
    "econnreset",
    "enotfound",
    "image",
    "load",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline"];

/// Substring heuristic for compositors that only return free-form text.
/// Only used when no typed kind accompanies the failure.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if TIMEOUT_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureKind::Timeout
    } else if STYLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureKind::Style
    } else if RESOURCE_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureKind::Resource
    } else {
        FailureKind::Other
    }
}

/// Font resolution errors. Never fatal to a render.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FontError {
    #[error("Font CSS request failed: {reason}")]
    Request { reason: String },

    #[error("Font endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Font CSS contained no usable @font-face rules")]
    NoFaces,

    #[error("All {count} font specs failed to resolve")]
    AllFailed { count: usize },
}

impl From<reqwest::Error> for FontError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FontError::Status {
                status: status.as_u16(),
            },
            None => FontError::Request {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_style_messages() {
        assert_eq!(
            classify_message("Unsupported CSS value for display: grid"),
            FailureKind::Style
        );
        assert_eq!(
            classify_message("Invalid value `fit-content` for width"),
            FailureKind::Style
        );
    }

    #[test]
    fn test_classify_resource_and_timeout() {
        assert_eq!(
            classify_message("Failed to download font from host"),
            FailureKind::Resource
        );
        assert_eq!(classify_message("render timed out"), FailureKind::Timeout);
        assert_eq!(classify_message("segfault"), FailureKind::Other);
    }

    #[test]
    fn test_classify_resource_messages_mentioning_style() {
        assert_eq!(
            classify_message("failed to load font-style variant"),
            FailureKind::Resource
        );
        assert_eq!(
            classify_message("failed to fetch stylesheet"),
            FailureKind::Resource
        );
        assert_eq!(
            classify_message("Unknown property `inset-block`"),
            FailureKind::Style
        );
    }

    #[test]
    fn test_compositor_error_display() {
        let err = CompositorError::new(FailureKind::Resource, "font host down");
        assert_eq!(format!("{}", err), "resource failure: font host down");
        assert!(!err.is_style());
        assert!(CompositorError::from_message("invalid style attribute").is_style());
    }
}
