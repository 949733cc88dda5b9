//! Render executor: drives the compositor through the recovery cascade.
//!
//! The cascade is data, not control flow. [`CASCADE`] lists every stage with
//! the condition under which it runs and the sanitize mode / font set it
//! uses; [`RenderExecutor::render`] walks it and returns on first success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use htmlshot_core::{FontAsset, RenderError, RenderJob, RenderOutput};

use crate::compositor::{CompositeRequest, Compositor};
use crate::error::{CompositorError, FailureKind};
use crate::fonts::FontSource;
use crate::sanitize::{collect_text, sanitize, RenderNode, SanitizeMode, SanitizeReport};

// ============================================================================
// CASCADE
// ============================================================================

/// When a stage runs, judged against the previous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGuard {
    /// First attempt; always runs.
    Always,
    /// Only after a style-like failure.
    AfterStyleFailure,
    /// Only if the previous attempt had fonts attached.
    WhenFontsAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelect {
    Fixed(SanitizeMode),
    /// Reuse the previous attempt's mode.
    KeepPrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub guard: StageGuard,
    pub mode: ModeSelect,
    pub with_fonts: bool,
}

pub const CASCADE: [Stage; 3] = [
    Stage {
        name: "standard",
        guard: StageGuard::Always,
        mode: ModeSelect::Fixed(SanitizeMode::Standard),
        with_fonts: true,
    },
    Stage {
        name: "strict",
        guard: StageGuard::AfterStyleFailure,
        mode: ModeSelect::Fixed(SanitizeMode::Strict),
        with_fonts: true,
    },
    Stage {
        name: "without_fonts",
        guard: StageGuard::WhenFontsAttached,
        mode: ModeSelect::KeepPrevious,
        with_fonts: false,
    },
];

/// A failed attempt, as seen by the next stage's guard.
#[derive(Debug, Clone)]
struct FailedAttempt {
    mode: SanitizeMode,
    fonts_attached: bool,
    error: CompositorError,
}

impl Stage {
    fn applies(&self, last: Option<&FailedAttempt>) -> bool {
        match (self.guard, last) {
            (StageGuard::Always, _) => true,
            (_, None) => false,
            (StageGuard::AfterStyleFailure, Some(last)) => last.error.is_style(),
            (StageGuard::WhenFontsAttached, Some(last)) => last.fonts_attached,
        }
    }

    fn mode(&self, last: Option<&FailedAttempt>) -> SanitizeMode {
        match self.mode {
            ModeSelect::Fixed(mode) => mode,
            ModeSelect::KeepPrevious => last.map(|a| a.mode).unwrap_or_default(),
        }
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

/// Outcome of one compositor attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(FailureKind),
}

/// Hooks for metrics. Never affects control flow.
pub trait RenderObserver: Send + Sync {
    fn sanitized(&self, _mode: SanitizeMode, _report: &SanitizeReport) {}
    fn fonts_resolved(&self, _faces: usize, _failed: bool) {}
    fn attempt(&self, _stage: &'static str, _outcome: AttemptOutcome, _elapsed: Duration) {}
}

/// Observer that records nothing.
pub struct NoopObserver;

impl RenderObserver for NoopObserver {}

// ============================================================================
// EXECUTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub attempt_timeout: Duration,
    pub max_concurrent_renders: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_concurrent_renders: 4,
        }
    }
}

pub struct RenderExecutor {
    compositor: Arc<dyn Compositor>,
    fonts: Arc<dyn FontSource>,
    permits: Arc<Semaphore>,
    config: ExecutorConfig,
    observer: Arc<dyn RenderObserver>,
}

impl RenderExecutor {
    pub fn new(
        compositor: Arc<dyn Compositor>,
        fonts: Arc<dyn FontSource>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            compositor,
            fonts,
            permits: Arc::new(Semaphore::new(config.max_concurrent_renders.max(1))),
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RenderObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Free compositor slots right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Render `job`, walking the cascade until one stage succeeds.
    ///
    /// # Errors
    /// `RenderError::Timeout` if the final attempt timed out,
    /// `RenderError::Failed` with the last message otherwise.
    pub async fn render(&self, job: &RenderJob) -> Result<RenderOutput, RenderError> {
        let started = Instant::now();

        let standard = self.sanitize(job, SanitizeMode::Standard);
        let mut strict: Option<RenderNode> = None;

        let text = collect_text(&standard);
        let fonts = match self.fonts.resolve(&job.fonts, &job.html, &job.css, &text).await {
            Ok(fonts) => {
                self.observer.fonts_resolved(fonts.len(), false);
                fonts
            }
            Err(err) => {
                tracing::warn!(error = %err, "font resolution failed, rendering without web fonts");
                self.observer.fonts_resolved(0, true);
                Arc::new(Vec::new())
            }
        };
        let no_fonts: Arc<Vec<FontAsset>> = Arc::new(Vec::new());

        let mut last: Option<FailedAttempt> = None;
        let mut attempts = 0u32;

        for stage in CASCADE.iter() {
            if !stage.applies(last.as_ref()) {
                continue;
            }

            let mode = stage.mode(last.as_ref());
            let tree = match mode {
                SanitizeMode::Standard => standard.clone(),
                SanitizeMode::Strict => strict
                    .get_or_insert_with(|| self.sanitize(job, SanitizeMode::Strict))
                    .clone(),
            };
            let attached = if stage.with_fonts {
                Arc::clone(&fonts)
            } else {
                Arc::clone(&no_fonts)
            };
            let fonts_attached = !attached.is_empty();

            let request = CompositeRequest {
                tree,
                width: job.width,
                height: job.height,
                format: job.format,
                quality: job.quality,
                fonts: attached,
            };

            attempts += 1;
            let attempt_started = Instant::now();
            match self.attempt(&request).await? {
                Ok(bytes) => {
                    self.observer.attempt(
                        stage.name,
                        AttemptOutcome::Success,
                        attempt_started.elapsed(),
                    );
                    let render_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        stage = stage.name,
                        attempts,
                        render_ms,
                        bytes = bytes.len(),
                        "render succeeded"
                    );
                    return Ok(RenderOutput {
                        bytes,
                        content_type: job.format.content_type(),
                        render_ms,
                        attempts,
                    });
                }
                Err(error) => {
                    self.observer.attempt(
                        stage.name,
                        AttemptOutcome::Failure(error.kind),
                        attempt_started.elapsed(),
                    );
                    tracing::warn!(
                        stage = stage.name,
                        kind = %error.kind,
                        mode = mode.as_str(),
                        fonts = fonts_attached,
                        error = %error.message,
                        "render attempt failed"
                    );
                    last = Some(FailedAttempt {
                        mode,
                        fonts_attached,
                        error,
                    });
                }
            }
        }

        Err(match last {
            Some(attempt) if attempt.error.kind == FailureKind::Timeout => RenderError::Timeout {
                timeout_ms: self.config.attempt_timeout.as_millis() as u64,
            },
            Some(attempt) => RenderError::Failed {
                message: attempt.error.message,
            },
            None => RenderError::Failed {
                message: "no render stage applied".to_string(),
            },
        })
    }

    fn sanitize(&self, job: &RenderJob, mode: SanitizeMode) -> RenderNode {
        let sanitized = sanitize(&job.html, &job.css, mode);
        self.observer.sanitized(mode, &sanitized.report);
        sanitized.root
    }

    /// One bounded attempt. The outer error means the executor itself is
    /// unusable; the inner one is a compositor failure for the cascade.
    async fn attempt(
        &self,
        request: &CompositeRequest,
    ) -> Result<Result<Vec<u8>, CompositorError>, RenderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RenderError::Unavailable {
                reason: e.to_string(),
            })?;

        let timeout = self.config.attempt_timeout;
        Ok(
            match tokio::time::timeout(timeout, self.compositor.composite(request)).await {
                Ok(result) => result,
                Err(_) => Err(CompositorError::new(
                    FailureKind::Timeout,
                    format!("attempt exceeded {}ms", timeout.as_millis()),
                )),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FontError;
    use async_trait::async_trait;
    use htmlshot_core::{FontSpec, FontStyle, ImageFormat};
    use std::sync::Mutex;

    /// Replays a fixed sequence of results and records every request.
    struct ScriptedCompositor {
        script: Mutex<Vec<Result<Vec<u8>, CompositorError>>>,
        seen: Mutex<Vec<CompositeRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedCompositor {
        fn new(script: Vec<Result<Vec<u8>, CompositorError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn seen(&self) -> Vec<CompositeRequest> {
            self.seen.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Compositor for ScriptedCompositor {
        async fn composite(&self, request: &CompositeRequest) -> Result<Vec<u8>, CompositorError> {
            self.seen.lock().expect("lock").push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or_else(|| Err(CompositorError::new(FailureKind::Other, "script exhausted")))
        }
    }

    struct StaticFonts(Arc<Vec<FontAsset>>);

    #[async_trait]
    impl FontSource for StaticFonts {
        async fn resolve(
            &self,
            _explicit: &[FontSpec],
            _html: &str,
            _css: &str,
            _text: &str,
        ) -> Result<Arc<Vec<FontAsset>>, FontError> {
            Ok(Arc::clone(&self.0))
        }
    }

    struct FailingFonts;

    #[async_trait]
    impl FontSource for FailingFonts {
        async fn resolve(
            &self,
            _explicit: &[FontSpec],
            _html: &str,
            _css: &str,
            _text: &str,
        ) -> Result<Arc<Vec<FontAsset>>, FontError> {
            Err(FontError::AllFailed { count: 1 })
        }
    }

    fn one_font() -> Arc<dyn FontSource> {
        Arc::new(StaticFonts(Arc::new(vec![FontAsset {
            family: "Inter".to_string(),
            weight: 400,
            style: FontStyle::Normal,
            data: vec![0; 4],
        }])))
    }

    fn job() -> RenderJob {
        RenderJob {
            html: r#"<div style="padding-top: env(safe-area-inset-top); color: red">Hi</div>"#
                .to_string(),
            css: String::new(),
            width: 200,
            height: 100,
            format: ImageFormat::Png,
            quality: None,
            fonts: vec![],
        }
    }

    fn executor(compositor: Arc<ScriptedCompositor>, fonts: Arc<dyn FontSource>) -> RenderExecutor {
        RenderExecutor::new(
            compositor,
            fonts,
            ExecutorConfig {
                attempt_timeout: Duration::from_millis(500),
                max_concurrent_renders: 2,
            },
        )
    }

    fn style_error() -> CompositorError {
        CompositorError::new(FailureKind::Style, "unsupported value")
    }

    fn resource_error() -> CompositorError {
        CompositorError::new(FailureKind::Resource, "font host down")
    }

    #[test]
    fn test_cascade_shape() {
        assert_eq!(CASCADE[0].guard, StageGuard::Always);
        assert!(CASCADE[0].with_fonts);
        assert_eq!(CASCADE[1].mode, ModeSelect::Fixed(SanitizeMode::Strict));
        assert!(!CASCADE[2].with_fonts);
        assert_eq!(CASCADE[2].mode, ModeSelect::KeepPrevious);
    }

    #[tokio::test]
    async fn test_first_success_stops_cascade() -> Result<(), RenderError> {
        let compositor = Arc::new(ScriptedCompositor::new(vec![Ok(vec![1, 2, 3])]));
        let output = executor(compositor.clone(), one_font()).render(&job()).await?;
        assert_eq!(output.bytes, vec![1, 2, 3]);
        assert_eq!(output.attempts, 1);
        assert_eq!(output.content_type, "image/png");
        assert_eq!(compositor.seen().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_style_failure_retries_strict() -> Result<(), RenderError> {
        let compositor = Arc::new(ScriptedCompositor::new(vec![
            Err(style_error()),
            Ok(vec![9]),
        ]));
        let output = executor(compositor.clone(), one_font()).render(&job()).await?;
        assert_eq!(output.attempts, 2);

        let seen = compositor.seen();
        assert!(seen[0].tree.props.style.contains_key("paddingTop"));
        assert!(!seen[1].tree.props.style.contains_key("paddingTop"));
        assert_eq!(seen[1].fonts.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_style_failure_drops_fonts() -> Result<(), RenderError> {
        let compositor = Arc::new(ScriptedCompositor::new(vec![
            Err(resource_error()),
            Ok(vec![7]),
        ]));
        let output = executor(compositor.clone(), one_font()).render(&job()).await?;
        assert_eq!(output.attempts, 2);

        let seen = compositor.seen();
        assert!(seen[1].fonts.is_empty());
        assert!(seen[1].tree.props.style.contains_key("paddingTop"));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_cascade_keeps_strict_mode() {
        let compositor = Arc::new(ScriptedCompositor::new(vec![
            Err(style_error()),
            Err(style_error()),
            Err(CompositorError::new(FailureKind::Other, "still broken")),
        ]));
        let err = executor(compositor.clone(), one_font())
            .render(&job())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::Failed {
                message: "still broken".to_string()
            }
        );

        let seen = compositor.seen();
        assert_eq!(seen.len(), 3);
        assert!(seen[2].fonts.is_empty());
        assert!(!seen[2].tree.props.style.contains_key("paddingTop"));
    }

    #[tokio::test]
    async fn test_no_fonts_means_single_attempt_for_other_failures() {
        let compositor = Arc::new(ScriptedCompositor::new(vec![Err(resource_error())]));
        let err = executor(compositor.clone(), Arc::new(FailingFonts))
            .render(&job())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Failed { .. }));
        assert_eq!(compositor.seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_cascade_failure() {
        let mut scripted = ScriptedCompositor::new(vec![Ok(vec![1]), Ok(vec![1])]);
        scripted.delay = Some(Duration::from_secs(5));
        let compositor = Arc::new(scripted);

        let err = executor(compositor.clone(), one_font())
            .render(&job())
            .await
            .unwrap_err();
        assert_eq!(err, RenderError::Timeout { timeout_ms: 500 });
        // Timeout is not style-like: standard, then without fonts.
        assert_eq!(compositor.seen().len(), 2);
    }
}
