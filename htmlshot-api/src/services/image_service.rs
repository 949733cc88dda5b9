//! Request orchestration for minting and serving signed image URLs.
//!
//! Serve order on every request:
//!
//! 1. parse and validate the query
//! 2. verify the signature, then the expiry
//! 3. `If-None-Match` short-circuit (304)
//! 4. cache lookup
//! 5. on miss: template, visibility, variables, quota, render, cache write
//!
//! Steps 1-3 never touch a collaborator. Usage is recorded in the background
//! for every outcome after step 3.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use htmlshot_core::{
    resolve_variables, ContentHash, ImageFormat, ImageRequestFields, QuotaDecision, RenderJob,
    ResolutionError, SignatureError, Signer, Template, TemplateProvider, Timestamp, UsageEvent,
    UsageSink, ValidationError,
};
use htmlshot_render::RenderExecutor;
use htmlshot_storage::{Authorized, CacheEntry, TieredCache};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{IMMUTABLE_CACHE_CONTROL, RENDER_CACHED_HEADER};
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::telemetry::METRICS;

static VARIABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("Invalid variable name regex"));

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Body of `POST /v1/image/mint`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
    pub template_id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
    /// Template version to pin. Defaults to the template's current version.
    #[serde(default)]
    pub tv: Option<String>,
    /// Requested URL lifetime; clamped to the configured maximum.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintResponse {
    pub url: String,
    pub expires_at: Timestamp,
    pub content_hash: ContentHash,
}

/// Result of a successful serve.
#[derive(Debug, Clone)]
pub enum ServeOutcome {
    /// `If-None-Match` matched; no body.
    NotModified { hash: ContentHash },
    Image {
        hash: ContentHash,
        entry: CacheEntry,
        cached: bool,
        /// Present only for fresh renders.
        render_ms: Option<u64>,
    },
}

impl IntoResponse for ServeOutcome {
    fn into_response(self) -> Response {
        match self {
            ServeOutcome::NotModified { hash } => {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                let headers = response.headers_mut();
                if let Ok(etag) = HeaderValue::from_str(&hash.etag()) {
                    headers.insert(header::ETAG, etag);
                }
                headers.insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static(IMMUTABLE_CACHE_CONTROL),
                );
                response
            }
            ServeOutcome::Image {
                hash,
                entry,
                cached,
                render_ms,
            } => {
                let content_type = entry.content_type();
                let bytes = Arc::try_unwrap(entry.bytes).unwrap_or_else(|shared| (*shared).clone());
                let mut response = Response::new(Body::from(Bytes::from(bytes)));
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                headers.insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static(IMMUTABLE_CACHE_CONTROL),
                );
                if let Ok(etag) = HeaderValue::from_str(&hash.etag()) {
                    headers.insert(header::ETAG, etag);
                }
                headers.insert(
                    RENDER_CACHED_HEADER,
                    HeaderValue::from_static(if cached { "1" } else { "0" }),
                );
                if let Some(ms) = render_ms {
                    if let Ok(timing) = HeaderValue::from_str(&format!("render;dur={}", ms)) {
                        headers.insert("server-timing", timing);
                    }
                }
                response
            }
        }
    }
}

// ============================================================================
// QUERY HELPERS
// ============================================================================

/// Split a raw query string into decoded pairs.
///
/// `+` decodes to a space, as in form encoding. A key without `=` has an
/// empty value.
pub fn parse_query(raw: &str) -> Result<Vec<(String, String)>, ValidationError> {
    let decode = |part: &str| -> Result<String, ValidationError> {
        let spaced = part.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|s| s.into_owned())
            .map_err(|_| ValidationError::InvalidValue {
                field: "query".to_string(),
                reason: format!("'{}' is not valid percent-encoded UTF-8", part),
            })
    };

    raw.split('&')
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            let (key, value) = piece.split_once('=').unwrap_or((piece, ""));
            Ok((decode(key)?, decode(value)?))
        })
        .collect()
}

/// Whether an `If-None-Match` header value matches `hash`.
///
/// Handles lists, the `*` wildcard and weak validators.
pub fn etag_matches(if_none_match: &str, hash: &ContentHash) -> bool {
    let hex = hash.to_hex();
    if_none_match.split(',').map(str::trim).any(|tag| {
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag == "*" || tag.trim_matches('"') == hex
    })
}

fn check_dimension(field: &str, value: Option<u32>, max: u32) -> Result<(), ValidationError> {
    match value {
        Some(v) if v == 0 || v > max => Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 1,
            max: max as u64,
        }),
        _ => Ok(()),
    }
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImageServiceConfig {
    /// Base of minted URLs, without a trailing slash.
    pub public_base_url: String,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub max_width: u32,
    pub max_height: u32,
}

/// Fields shared by every usage event of one serve.
#[derive(Debug, Clone)]
struct UsageContext {
    user_id: String,
    template_id: String,
    hash: ContentHash,
    format: ImageFormat,
}

pub struct ImageService {
    signer: Signer,
    cache: Arc<TieredCache>,
    executor: Arc<RenderExecutor>,
    templates: Arc<dyn TemplateProvider>,
    quota: Arc<dyn QuotaDecision>,
    usage: Arc<dyn UsageSink>,
    config: ImageServiceConfig,
}

impl ImageService {
    pub fn new(
        signer: Signer,
        cache: Arc<TieredCache>,
        executor: Arc<RenderExecutor>,
        templates: Arc<dyn TemplateProvider>,
        quota: Arc<dyn QuotaDecision>,
        usage: Arc<dyn UsageSink>,
        config: ImageServiceConfig,
    ) -> Self {
        Self {
            signer,
            cache,
            executor,
            templates,
            quota,
            usage,
            config,
        }
    }

    pub fn config(&self) -> &ImageServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    // ------------------------------------------------------------------------
    // MINT
    // ------------------------------------------------------------------------

    /// Validate a mint request and return a signed URL for it.
    pub async fn mint(&self, auth: &Authorized, request: MintRequest) -> ApiResult<MintResponse> {
        let template_id = request.template_id.trim();
        if template_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "templateId".to_string(),
            }
            .into());
        }
        check_dimension("width", request.width, self.config.max_width)?;
        check_dimension("height", request.height, self.config.max_height)?;
        if let Some(quality) = request.quality {
            if !(1..=100).contains(&quality) {
                return Err(ValidationError::OutOfRange {
                    field: "quality".to_string(),
                    min: 1,
                    max: 100,
                }
                .into());
            }
        }
        let format = match request.format.as_deref() {
            Some(raw) => Some(ImageFormat::parse(raw).ok_or_else(|| {
                ValidationError::InvalidValue {
                    field: "format".to_string(),
                    reason: format!("unsupported format '{}'", raw),
                }
            })?),
            None => None,
        };
        if let Some(name) = request.variables.keys().find(|n| !VARIABLE_NAME.is_match(n)) {
            return Err(ValidationError::InvalidValue {
                field: "variables".to_string(),
                reason: format!("invalid variable name '{}'", name),
            }
            .into());
        }
        let ttl = match request.ttl_seconds {
            Some(0) => {
                return Err(ValidationError::OutOfRange {
                    field: "ttlSeconds".to_string(),
                    min: 1,
                    max: self.config.max_ttl.as_secs(),
                }
                .into())
            }
            Some(secs) => Duration::from_secs(secs).min(self.config.max_ttl),
            None => self.config.default_ttl,
        };

        let template = self.visible_template(template_id, &auth.user_id).await?;
        resolve_variables(&template, &request.variables)?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ApiError::internal_error(format!("URL lifetime overflow: {}", e)))?;

        let mut fields = ImageRequestFields::new(template_id, &auth.user_id, expires_at.timestamp());
        fields.width = request.width;
        fields.height = request.height;
        fields.format = format;
        fields.quality = request.quality;
        fields.tv = Some(
            request
                .tv
                .filter(|tv| !tv.trim().is_empty())
                .unwrap_or_else(|| template.version_tag()),
        );
        fields.variables = request.variables;

        let canonical = fields.canonical();
        let signature = self.signer.sign(&canonical);
        let content_hash = fields.content_hash();

        tracing::info!(
            template_id = %template_id,
            user_id = %auth.user_id,
            hash = %content_hash,
            expires_at = %expires_at,
            "Minted signed image URL"
        );

        Ok(MintResponse {
            url: format!(
                "{}/v1/image?{}&sig={}",
                self.config.public_base_url,
                canonical,
                urlencoding::encode(&signature)
            ),
            expires_at,
            content_hash,
        })
    }

    // ------------------------------------------------------------------------
    // SERVE
    // ------------------------------------------------------------------------

    /// Serve the image for a signed query string.
    pub async fn serve(
        &self,
        raw_query: Option<&str>,
        if_none_match: Option<&str>,
    ) -> ApiResult<ServeOutcome> {
        let pairs = parse_query(raw_query.unwrap_or_default())?;
        let (fields, signature) = ImageRequestFields::from_query_pairs(pairs)?;
        check_dimension("width", fields.width, self.config.max_width)?;
        check_dimension("height", fields.height, self.config.max_height)?;

        let canonical = fields.canonical();
        let signature = signature.ok_or(SignatureError::Missing)?;
        if !self.signer.verify(&canonical, &signature) {
            tracing::debug!(template_id = %fields.template_id, "Rejected invalid signature");
            return Err(SignatureError::Invalid.into());
        }
        if fields.is_expired(Utc::now().timestamp()) {
            return Err(SignatureError::Expired {
                expired_at: fields.exp,
            }
            .into());
        }

        let hash = ContentHash::of_canonical(&canonical);
        if let Some(tag) = if_none_match {
            if etag_matches(tag, &hash) {
                return Ok(ServeOutcome::NotModified { hash });
            }
        }

        let context = UsageContext {
            user_id: fields.uid.clone(),
            template_id: fields.template_id.clone(),
            hash,
            format: fields.format.unwrap_or_default(),
        };

        match self.serve_verified(&fields, hash).await {
            Ok(outcome) => {
                if let ServeOutcome::Image {
                    entry,
                    cached,
                    render_ms,
                    ..
                } = &outcome
                {
                    let context = UsageContext {
                        format: entry.format,
                        ..context
                    };
                    self.record_usage(&context, StatusCode::OK, *cached, *render_ms, None);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.record_usage(
                    &context,
                    err.status_code(),
                    false,
                    None,
                    Some(err.code),
                );
                Err(err)
            }
        }
    }

    async fn serve_verified(
        &self,
        fields: &ImageRequestFields,
        hash: ContentHash,
    ) -> ApiResult<ServeOutcome> {
        let lookup = self.cache.get(&hash, fields.format).await;
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.record_cache_lookup(lookup.as_ref().map(|(_, tier)| *tier));
        }
        if let Some((entry, tier)) = lookup {
            tracing::debug!(hash = %hash, tier = tier.as_str(), "Serving cached image");
            return Ok(ServeOutcome::Image {
                hash,
                entry,
                cached: true,
                render_ms: None,
            });
        }

        let template = self.visible_template(&fields.template_id, &fields.uid).await?;
        let values = resolve_variables(&template, &fields.variables)?;

        let verdict = self.quota.check_quota(&fields.uid).await?;
        if !verdict.allowed {
            let code = verdict
                .code
                .as_deref()
                .and_then(ErrorCode::from_wire)
                .unwrap_or(ErrorCode::QuotaExceeded);
            let message = verdict
                .message
                .clone()
                .unwrap_or_else(|| code.default_message().to_string());
            tracing::info!(user_id = %fields.uid, code = %code, "Quota denied render");
            let mut err = ApiError::new(code, message);
            if let Some(status) = verdict.status {
                err = err.with_details(serde_json::json!({ "status": status }));
            }
            return Err(err);
        }

        let (html, css) = template.render_sources(&values);
        let format = fields.format.unwrap_or(template.format);
        let job = RenderJob {
            html,
            css,
            width: fields.width.unwrap_or(template.width),
            height: fields.height.unwrap_or(template.height),
            format,
            quality: fields.quality,
            fonts: Vec::new(),
        };
        let output = self.executor.render(&job).await?;

        let entry = CacheEntry::new(output.bytes, format);
        // Disk persistence finishes in the background.
        drop(self.cache.put(hash, entry.clone()));
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.set_cache_stats(&self.cache.stats());
        }

        Ok(ServeOutcome::Image {
            hash,
            entry,
            cached: false,
            render_ms: Some(output.render_ms),
        })
    }

    /// Fetch a template the caller may render. Invisible templates are
    /// reported exactly like missing ones.
    async fn visible_template(&self, template_id: &str, uid: &str) -> ApiResult<Template> {
        match self.templates.fetch_template(template_id).await? {
            Some(template) if template.is_visible_to(uid) => Ok(template),
            _ => Err(ResolutionError::TemplateNotFound {
                id: template_id.to_string(),
            }
            .into()),
        }
    }

    fn record_usage(
        &self,
        context: &UsageContext,
        status: StatusCode,
        cached: bool,
        render_ms: Option<u64>,
        error_code: Option<ErrorCode>,
    ) {
        let event = UsageEvent {
            user_id: context.user_id.clone(),
            template_id: context.template_id.clone(),
            content_hash: context.hash,
            status: status.as_u16(),
            cached,
            format: context.format,
            render_ms,
            error_code: error_code.map(|code| code.as_wire()),
            created_at: Utc::now(),
        };
        let sink = Arc::clone(&self.usage);
        tokio::spawn(async move {
            if let Err(e) = sink.record(event).await {
                tracing::warn!(error = %e, "Failed to record usage event");
                if let Ok(metrics) = METRICS.as_ref() {
                    metrics.record_usage_failure("sink_error");
                }
            }
        });
    }
}
