//! htmlshot Core - Domain Types and Request Signing
//!
//! Pure data structures shared by every other crate, plus the two pieces of
//! logic that must stay bit-for-bit identical across mint and serve: query
//! canonicalization and HMAC signing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

pub mod canonical;
pub mod collaborators;
pub mod error;
pub mod signer;
pub mod template;

pub use canonical::{canonicalize, ImageRequestFields, SIGNATURE_KEY, VARIABLE_PREFIX};
pub use collaborators::{QuotaDecision, QuotaVerdict, TemplateProvider, UsageEvent, UsageSink};
pub use error::{
    AuthError, ConfigError, HtmlshotError, HtmlshotResult, RenderError, ResolutionError,
    SignatureError, StorageError, UpstreamError, ValidationError,
};
pub use signer::{hash_api_key, Signer};
pub use template::{resolve_variables, substitute, Escape, Template, TemplateVariable};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// IMAGE FORMAT
// ============================================================================

/// Output raster format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    /// All supported formats, in disk-probe order.
    pub const ALL: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Webp];

    /// Parse a user-supplied format name (case-insensitive, `jpg` accepted).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    /// Canonical name used in signed queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    /// Normalized file extension used by the disk tier.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.content_type().eq_ignore_ascii_case(content_type))
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    /// Whether the `quality` parameter has any effect for this format.
    pub fn is_lossy(&self) -> bool {
        !matches!(self, ImageFormat::Png)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// SHA-256 digest of a canonical query string.
///
/// Used as cache key, disk filename stem and ETag. Identical canonical
/// queries always produce identical hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of_canonical(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        let hash: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(hash))
    }

    /// Quoted form used in `ETag` / `If-None-Match`.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        ContentHash::from_hex(&value)
            .ok_or_else(|| serde::de::Error::custom("expected 64 hex characters"))
    }
}

// ============================================================================
// FONTS
// ============================================================================

/// A requested web font family, optionally qualified with an axis/variant
/// selector in the web-font CSS API syntax (e.g. `wght@400;700`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FontSpec {
    pub family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl FontSpec {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Merge key: families are matched case-insensitively.
    pub fn key(&self) -> String {
        self.family.trim().to_lowercase()
    }

    /// Parse the `family` query value form: `Open+Sans:wght@400;700`.
    pub fn parse_query_value(value: &str) -> Option<Self> {
        let value = value.trim();
        let (family, variant) = match value.split_once(':') {
            Some((family, variant)) => (family, Some(variant.trim())),
            None => (value, None),
        };
        let family = family.replace('+', " ").trim().to_string();
        if family.is_empty() {
            return None;
        }
        let variant = variant
            .filter(|v| !v.is_empty() && v.chars().all(is_variant_char))
            .map(str::to_string);
        Some(Self { family, variant })
    }

    /// Encode back into the `family` query value form.
    pub fn query_value(&self) -> String {
        let family = urlencoding::encode(self.family.trim()).replace("%20", "+");
        match &self.variant {
            Some(variant) => format!("{}:{}", family, variant),
            None => family,
        }
    }
}

fn is_variant_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '@' | ';' | ',' | '.' | '-')
}

/// Font style of a downloaded face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
}

impl FontStyle {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "italic" | "oblique" => FontStyle::Italic,
            _ => FontStyle::Normal,
        }
    }
}

/// A downloaded font binary ready to hand to the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontAsset {
    pub family: String,
    pub weight: u16,
    pub style: FontStyle,
    pub data: Vec<u8>,
}

// ============================================================================
// RENDERING
// ============================================================================

/// A fully resolved render request. Template variables are already
/// substituted; nothing here is user-controlled beyond validated values.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub html: String,
    pub css: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub quality: Option<u8>,
    /// Fonts explicitly requested by the caller, merged with discovered ones.
    pub fonts: Vec<FontSpec>,
}

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub render_ms: u64,
    /// Number of compositor attempts the cascade needed.
    pub attempts: u32,
}

// ============================================================================
// AUTH / QUOTA FACTS
// ============================================================================

/// An API key as replicated from the origin service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFact {
    pub key_hash: String,
    pub user_id: String,
    pub active: bool,
}

/// Per-user quota state as replicated from the origin service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaFact {
    pub user_id: String,
    pub plan: String,
    pub monthly_limit: u64,
    pub current_usage: u64,
    pub subscription_status: String,
}

impl QuotaFact {
    /// `current_usage == monthly_limit - 1` is still allowed.
    pub fn has_remaining(&self) -> bool {
        self.current_usage < self.monthly_limit
    }

    pub fn remaining(&self) -> u64 {
        self.monthly_limit.saturating_sub(self.current_usage)
    }

    pub fn subscription_blocks_usage(&self) -> bool {
        matches!(
            self.subscription_status.to_ascii_lowercase().as_str(),
            "canceled" | "cancelled" | "unpaid" | "incomplete_expired"
        )
    }
}

/// Full authoritative state pushed by the origin service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub keys: Vec<AuthFact>,
    #[serde(default)]
    pub quotas: Vec<QuotaFact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_format_parse() {
        assert_eq!(ImageFormat::parse("PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::parse("jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::parse("webp"), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::parse("gif"), None);
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
        assert_eq!(ImageFormat::from_extension("jpeg"), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::of_canonical("exp=1&templateId=t&uid=u");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
        assert_eq!(hash.etag(), format!("\"{}\"", hex));
        assert!(ContentHash::from_hex("abc").is_none());
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        assert_eq!(
            ContentHash::of_canonical("a=1"),
            ContentHash::of_canonical("a=1")
        );
        assert_ne!(
            ContentHash::of_canonical("a=1"),
            ContentHash::of_canonical("a=2")
        );
    }

    #[test]
    fn test_font_spec_query_value() {
        let spec = FontSpec::parse_query_value("Open+Sans:wght@400;700").expect("valid spec");
        assert_eq!(spec.family, "Open Sans");
        assert_eq!(spec.variant.as_deref(), Some("wght@400;700"));
        assert_eq!(spec.query_value(), "Open+Sans:wght@400;700");
        assert_eq!(spec.key(), "open sans");

        assert!(FontSpec::parse_query_value(":wght@400").is_none());
        let no_variant = FontSpec::parse_query_value("Inter:<script>").expect("family kept");
        assert!(no_variant.variant.is_none());
    }

    #[test]
    fn test_quota_boundary() {
        let mut quota = QuotaFact {
            user_id: "u1".to_string(),
            plan: "free".to_string(),
            monthly_limit: 100,
            current_usage: 99,
            subscription_status: "active".to_string(),
        };
        assert!(quota.has_remaining());
        quota.current_usage = 100;
        assert!(!quota.has_remaining());
        assert_eq!(quota.remaining(), 0);
    }

    #[test]
    fn test_snapshot_deserializes_camel_case() -> Result<(), serde_json::Error> {
        let json = r#"{
            "keys": [{"keyHash": "abc", "userId": "u1", "active": true}],
            "quotas": [{"userId": "u1", "plan": "pro", "monthlyLimit": 10,
                        "currentUsage": 2, "subscriptionStatus": "active"}]
        }"#;
        let snapshot: Snapshot = serde_json::from_str(json)?;
        assert_eq!(snapshot.keys.len(), 1);
        assert_eq!(snapshot.quotas[0].monthly_limit, 10);
        Ok(())
    }
}
