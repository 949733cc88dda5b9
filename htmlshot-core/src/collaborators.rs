//! Interfaces to the origin service.
//!
//! The image service never owns templates, quotas or usage accounting. It
//! reaches them through these traits; the API crate ships HTTP
//! implementations and tests plug in in-memory ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::{ContentHash, ImageFormat, Template, Timestamp};

// ============================================================================
// TEMPLATES
// ============================================================================

#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// `Ok(None)` when the template does not exist.
    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, UpstreamError>;
}

// ============================================================================
// QUOTA
// ============================================================================

/// Answer to a quota check. Consulted only on cache miss, before rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaVerdict {
    pub allowed: bool,
    /// Machine-readable denial code, e.g. `QUOTA_EXCEEDED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// HTTP status the origin suggests for the denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl QuotaVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            code: None,
            message: None,
            status: None,
        }
    }

    pub fn deny(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code: Some(code.into()),
            message: Some(message.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[async_trait]
pub trait QuotaDecision: Send + Sync {
    async fn check_quota(&self, user_id: &str) -> Result<QuotaVerdict, UpstreamError>;
}

// ============================================================================
// USAGE
// ============================================================================

/// One served image, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub user_id: String,
    pub template_id: String,
    pub content_hash: ContentHash,
    /// HTTP status returned to the client.
    pub status: u16,
    pub cached: bool,
    pub format: ImageFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub created_at: Timestamp,
}

/// Best-effort usage accounting. Callers log failures and move on.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, event: UsageEvent) -> Result<(), UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[test]
    fn test_quota_verdict_wire_format() -> Result<(), serde_json::Error> {
        let verdict: QuotaVerdict = serde_json::from_str(
            r#"{"allowed":false,"code":"QUOTA_EXCEEDED","message":"Monthly limit reached","status":429}"#,
        )?;
        assert!(!verdict.allowed);
        assert_eq!(verdict.code.as_deref(), Some("QUOTA_EXCEEDED"));
        assert_eq!(verdict.status, Some(429));

        let allowed: QuotaVerdict = serde_json::from_str(r#"{"allowed":true}"#)?;
        assert_eq!(allowed, QuotaVerdict::allow());
        Ok(())
    }

    #[test]
    fn test_usage_event_serializes_camel_case() -> Result<(), serde_json::Error> {
        let event = UsageEvent {
            user_id: "u1".to_string(),
            template_id: "t1".to_string(),
            content_hash: ContentHash::of_canonical("a=1"),
            status: 200,
            cached: true,
            format: ImageFormat::Png,
            render_ms: None,
            error_code: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["contentHash"], event.content_hash.to_hex());
        assert!(json.get("renderMs").is_none());
        Ok(())
    }

    struct Collect(Mutex<Vec<UsageEvent>>);

    #[async_trait]
    impl UsageSink for Collect {
        async fn record(&self, event: UsageEvent) -> Result<(), UpstreamError> {
            if let Ok(mut events) = self.0.lock() {
                events.push(event);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_usage_sink_is_object_safe() -> Result<(), UpstreamError> {
        let sink: Box<dyn UsageSink> = Box::new(Collect(Mutex::new(Vec::new())));
        sink.record(UsageEvent {
            user_id: "u1".to_string(),
            template_id: "t1".to_string(),
            content_hash: ContentHash::of_canonical("a=1"),
            status: 500,
            cached: false,
            format: ImageFormat::Webp,
            render_ms: Some(12),
            error_code: Some("RENDER_FAILED".to_string()),
            created_at: Utc::now(),
        })
        .await
    }
}
