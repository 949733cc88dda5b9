//! htmlshot Test Utilities
//!
//! Shared test infrastructure for the htmlshot workspace:
//! - In-memory doubles for the origin collaborators (templates, quota, usage)
//! - A scripted compositor and a static font source for the render executor
//! - Fixtures for signed requests, templates and replica snapshots
//! - Proptest generators for request field sets

pub use htmlshot_core::{
    hash_api_key, AuthFact, ContentHash, FontAsset, FontStyle, ImageFormat, ImageRequestFields,
    QuotaDecision, QuotaFact, QuotaVerdict, Signer, Snapshot, Template, TemplateProvider,
    TemplateVariable, Timestamp, UpstreamError, UsageEvent, UsageSink,
};
pub use htmlshot_render::{CompositeRequest, Compositor, CompositorError, FailureKind, FontSource};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use htmlshot_core::FontSpec;
use htmlshot_render::FontError;

// ============================================================================
// COMPOSITOR
// ============================================================================

/// Compositor double. Replays scripted results first, then falls back to a
/// deterministic fake image derived from the request.
#[derive(Default)]
pub struct MockCompositor {
    script: Mutex<VecDeque<Result<Vec<u8>, CompositorError>>>,
    seen: Mutex<Vec<CompositeRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results returned in order before falling back to fake bytes.
    pub fn with_script(script: Vec<Result<Vec<u8>, CompositorError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fail with `kind`.
    pub fn failing(kind: FailureKind, message: &str, times: usize) -> Self {
        Self::with_script(
            (0..times)
                .map(|_| Err(CompositorError::new(kind, message)))
                .collect(),
        )
    }

    pub fn push(&self, result: Result<Vec<u8>, CompositorError>) {
        self.script
            .lock()
            .expect("compositor script lock poisoned")
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<CompositeRequest> {
        self.seen
            .lock()
            .expect("compositor seen lock poisoned")
            .clone()
    }

    /// Bytes produced for a request when no script entry is left.
    pub fn fake_image(request: &CompositeRequest) -> Vec<u8> {
        format!(
            "{}-mock-{}x{}",
            request.format.as_str(),
            request.width,
            request.height
        )
        .into_bytes()
    }
}

#[async_trait]
impl Compositor for MockCompositor {
    async fn composite(&self, request: &CompositeRequest) -> Result<Vec<u8>, CompositorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("compositor seen lock poisoned")
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .expect("compositor script lock poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| Ok(Self::fake_image(request)))
    }
}

// ============================================================================
// FONTS
// ============================================================================

/// Font source that always returns the same set and never touches the network.
#[derive(Default)]
pub struct StaticFonts {
    fonts: Arc<Vec<FontAsset>>,
    calls: AtomicUsize,
}

impl StaticFonts {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_fonts(fonts: Vec<FontAsset>) -> Self {
        Self {
            fonts: Arc::new(fonts),
            calls: AtomicUsize::new(0),
        }
    }

    /// A single regular face of `family` with placeholder bytes.
    pub fn single(family: &str) -> Self {
        Self::with_fonts(vec![FontAsset {
            family: family.to_string(),
            weight: 400,
            style: FontStyle::Normal,
            data: vec![0, 1, 0, 0],
        }])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FontSource for StaticFonts {
    async fn resolve(
        &self,
        _explicit: &[FontSpec],
        _html: &str,
        _css: &str,
        _text: &str,
    ) -> Result<Arc<Vec<FontAsset>>, FontError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.fonts))
    }
}

// ============================================================================
// TEMPLATES
// ============================================================================

/// Template provider backed by a map. Can be switched into a failing mode.
#[derive(Default)]
pub struct InMemoryTemplates {
    templates: RwLock<HashMap<String, Template>>,
    calls: AtomicUsize,
    fail_with: RwLock<Option<UpstreamError>>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(templates: impl IntoIterator<Item = Template>) -> Self {
        let provider = Self::new();
        for template in templates {
            provider.insert(template);
        }
        provider
    }

    pub fn insert(&self, template: Template) {
        self.templates
            .write()
            .expect("templates lock poisoned")
            .insert(template.id.clone(), template);
    }

    pub fn remove(&self, template_id: &str) -> Option<Template> {
        self.templates
            .write()
            .expect("templates lock poisoned")
            .remove(template_id)
    }

    /// Every subsequent fetch fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<UpstreamError>) {
        *self.fail_with.write().expect("failure lock poisoned") = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateProvider for InMemoryTemplates {
    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_with.read().expect("failure lock poisoned").clone() {
            return Err(error);
        }
        Ok(self
            .templates
            .read()
            .expect("templates lock poisoned")
            .get(template_id)
            .cloned())
    }
}

// ============================================================================
// QUOTA
// ============================================================================

/// Quota decision that answers every user the same way.
pub struct StaticQuota {
    verdict: RwLock<QuotaVerdict>,
    calls: AtomicUsize,
}

impl StaticQuota {
    pub fn allow() -> Self {
        Self::with_verdict(QuotaVerdict::allow())
    }

    pub fn deny(code: &str, message: &str) -> Self {
        Self::with_verdict(QuotaVerdict::deny(code, message))
    }

    pub fn with_verdict(verdict: QuotaVerdict) -> Self {
        Self {
            verdict: RwLock::new(verdict),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, verdict: QuotaVerdict) {
        *self.verdict.write().expect("quota lock poisoned") = verdict;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuotaDecision for StaticQuota {
    async fn check_quota(&self, _user_id: &str) -> Result<QuotaVerdict, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.read().expect("quota lock poisoned").clone())
    }
}

// ============================================================================
// USAGE
// ============================================================================

/// Usage sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingUsageSink {
    events: Mutex<Vec<UsageEvent>>,
    failing: bool,
    notify: tokio::sync::Notify,
}

impl RecordingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every event after recording the attempt.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().expect("usage lock poisoned").clone()
    }

    /// Wait until at least `count` events arrived. Usage is recorded on a
    /// spawned task, so tests poll instead of asserting immediately.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<UsageEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.events();
            }
        }
    }
}

#[async_trait]
impl UsageSink for RecordingUsageSink {
    async fn record(&self, event: UsageEvent) -> Result<(), UpstreamError> {
        self.events.lock().expect("usage lock poisoned").push(event);
        self.notify.notify_waiters();
        if self.failing {
            return Err(UpstreamError::Status { status: 503 });
        }
        Ok(())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use secrecy::SecretString;

    /// Signing secret used across tests. Long enough to pass validation.
    pub const TEST_SECRET: &str = "htmlshot-test-signing-secret-0123456789abcdef";

    pub const TEST_API_KEY: &str = "hs_test_key_0001";
    pub const TEST_USER: &str = "user_1";

    pub fn secret() -> SecretString {
        SecretString::new(TEST_SECRET.into())
    }

    pub fn signer() -> Signer {
        Signer::new(&secret()).expect("test secret is valid")
    }

    pub fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid fixture time")
    }

    /// A public 400x200 PNG card with one required and one optional variable.
    pub fn card_template(id: &str, owner: &str) -> Template {
        Template {
            id: id.to_string(),
            html: r#"<div style="display:flex;width:100%;height:100%;background:#fff"><h1>{{ title }}</h1><p>{{ subtitle }}</p></div>"#
                .to_string(),
            css: "h1 { color: #111; font-size: 48px; }".to_string(),
            variables: vec![
                TemplateVariable {
                    name: "title".to_string(),
                    default_value: None,
                    required: true,
                },
                TemplateVariable {
                    name: "subtitle".to_string(),
                    default_value: Some("by htmlshot".to_string()),
                    required: false,
                },
            ],
            width: 400,
            height: 200,
            format: ImageFormat::Png,
            is_public: true,
            user_id: owner.to_string(),
            updated_at: fixed_time(),
        }
    }

    pub fn private_template(id: &str, owner: &str) -> Template {
        Template {
            is_public: false,
            ..card_template(id, owner)
        }
    }

    /// Snapshot granting `api_key` to `user_id` with the given quota state.
    pub fn snapshot_for(api_key: &str, user_id: &str, limit: u64, usage: u64) -> Snapshot {
        Snapshot {
            keys: vec![AuthFact {
                key_hash: hash_api_key(api_key),
                user_id: user_id.to_string(),
                active: true,
            }],
            quotas: vec![QuotaFact {
                user_id: user_id.to_string(),
                plan: "free".to_string(),
                monthly_limit: limit,
                current_usage: usage,
                subscription_status: "active".to_string(),
            }],
        }
    }

    /// Field set for `template` with `title` set, expiring at `exp`.
    pub fn request_fields(template: &Template, uid: &str, exp: i64) -> ImageRequestFields {
        let mut fields = ImageRequestFields::new(&template.id, uid, exp);
        fields.tv = Some(template.version_tag());
        fields
            .variables
            .insert("title".to_string(), "Hello".to_string());
        fields
    }

    /// `canonical&sig=...` query string for `fields`.
    pub fn signed_query(signer: &Signer, fields: &ImageRequestFields) -> String {
        let canonical = fields.canonical();
        let signature = signer.sign(&canonical);
        format!("{}&sig={}", canonical, signature)
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    pub fn arb_format() -> impl Strategy<Value = ImageFormat> {
        prop::sample::select(ImageFormat::ALL.to_vec())
    }

    /// Arbitrary but valid request field sets, including awkward values that
    /// need percent-encoding.
    pub fn arb_request_fields() -> impl Strategy<Value = ImageRequestFields> {
        (
            "[a-z0-9_-]{1,16}",
            "[a-z0-9_]{1,12}",
            1_600_000_000i64..2_000_000_000i64,
            proptest::option::of(1u32..4096),
            proptest::option::of(1u32..4096),
            proptest::option::of(arb_format()),
            proptest::option::of(1u8..=100),
            prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", "[ -~]{0,24}", 0..5),
        )
            .prop_map(
                |(template_id, uid, exp, width, height, format, quality, variables)| {
                    ImageRequestFields {
                        template_id,
                        uid,
                        exp,
                        width,
                        height,
                        format,
                        quality,
                        tv: None,
                        variables: variables.into_iter().collect::<BTreeMap<_, _>>(),
                    }
                },
            )
    }
}
