//! Prometheus Metrics Definitions
//!
//! Defines all htmlshot metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use htmlshot_render::{AttemptOutcome, RenderObserver, SanitizeMode, SanitizeReport};
use htmlshot_storage::{CacheStats, CacheTier, ReplicaStatus};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Compositor attempt latency buckets (seconds). Renders run far longer than
/// plain requests, up to the attempt timeout.
const RENDER_LATENCY_BUCKETS: &[f64] =
    &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<HtmlshotMetrics>> = Lazy::new(HtmlshotMetrics::new);

/// Container for all htmlshot metrics.
#[derive(Clone)]
pub struct HtmlshotMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Compositor attempts - labels: stage, outcome
    pub render_attempts_total: CounterVec,

    /// Compositor attempt duration - labels: stage
    pub render_attempt_duration_seconds: HistogramVec,

    /// Cache lookups - labels: tier (memory/disk/none), outcome (hit/miss)
    pub cache_lookups_total: CounterVec,

    /// CSS declarations seen by the sanitizer - labels: mode, result
    pub sanitizer_declarations_total: CounterVec,

    /// Dropped declarations - labels: reason
    pub sanitizer_drops_total: CounterVec,

    /// Font resolutions - labels: outcome (resolved/empty/failed)
    pub font_resolutions_total: CounterVec,

    /// Rows in the replica's key table
    pub replica_keys: Gauge,

    /// Rows in the replica's quota table
    pub replica_quotas: Gauge,

    /// Snapshots applied since process start
    pub replica_last_update: Gauge,

    /// Snapshot feed connection events - labels: event
    pub snapshot_feed_events_total: CounterVec,

    /// Bearer auth decisions - labels: outcome (allowed or a denial code)
    pub auth_decisions_total: CounterVec,

    /// Usage sink failures
    pub usage_record_failures_total: CounterVec,

    /// Entries in the memory cache tier
    pub cache_memory_entries: Gauge,

    /// Bytes held by the memory cache tier
    pub cache_memory_bytes: Gauge,
}

impl HtmlshotMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "htmlshot_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_requests_total: {}", e)))?,

            http_request_duration_seconds: register_histogram_vec!(
                "htmlshot_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_request_duration_seconds: {}", e)))?,

            render_attempts_total: register_counter_vec!(
                "htmlshot_render_attempts_total",
                "Total compositor attempts by cascade stage and outcome",
                &["stage", "outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register render_attempts_total: {}", e)))?,

            render_attempt_duration_seconds: register_histogram_vec!(
                "htmlshot_render_attempt_duration_seconds",
                "Compositor attempt duration in seconds",
                &["stage"],
                RENDER_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register render_attempt_duration_seconds: {}", e)))?,

            cache_lookups_total: register_counter_vec!(
                "htmlshot_cache_lookups_total",
                "Image cache lookups by tier and outcome",
                &["tier", "outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register cache_lookups_total: {}", e)))?,

            sanitizer_declarations_total: register_counter_vec!(
                "htmlshot_sanitizer_declarations_total",
                "CSS declarations processed by the sanitizer",
                &["mode", "result"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register sanitizer_declarations_total: {}", e)))?,

            sanitizer_drops_total: register_counter_vec!(
                "htmlshot_sanitizer_drops_total",
                "CSS declarations dropped by the sanitizer",
                &["reason"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register sanitizer_drops_total: {}", e)))?,

            font_resolutions_total: register_counter_vec!(
                "htmlshot_font_resolutions_total",
                "Font resolution outcomes",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register font_resolutions_total: {}", e)))?,

            replica_keys: register_gauge!(
                "htmlshot_replica_keys",
                "API keys held by the auth replica"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register replica_keys: {}", e)))?,

            replica_quotas: register_gauge!(
                "htmlshot_replica_quotas",
                "Quota rows held by the auth replica"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register replica_quotas: {}", e)))?,

            replica_last_update: register_gauge!(
                "htmlshot_replica_last_update",
                "Snapshots applied to the auth replica"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register replica_last_update: {}", e)))?,

            snapshot_feed_events_total: register_counter_vec!(
                "htmlshot_snapshot_feed_events_total",
                "Snapshot feed connection events",
                &["event"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register snapshot_feed_events_total: {}", e)))?,

            auth_decisions_total: register_counter_vec!(
                "htmlshot_auth_decisions_total",
                "Bearer token authorization decisions",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register auth_decisions_total: {}", e)))?,

            usage_record_failures_total: register_counter_vec!(
                "htmlshot_usage_record_failures_total",
                "Usage events the sink failed to record",
                &["reason"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register usage_record_failures_total: {}", e)))?,

            cache_memory_entries: register_gauge!(
                "htmlshot_cache_memory_entries",
                "Entries in the memory cache tier"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register cache_memory_entries: {}", e)))?,

            cache_memory_bytes: register_gauge!(
                "htmlshot_cache_memory_bytes",
                "Bytes held by the memory cache tier"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register cache_memory_bytes: {}", e)))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status_str.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record one compositor attempt.
    pub fn record_render_attempt(&self, stage: &str, outcome: AttemptOutcome, elapsed: Duration) {
        let outcome = match outcome {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure(kind) => kind.as_str(),
        };
        self.render_attempts_total
            .with_label_values(&[stage, outcome])
            .inc();
        self.render_attempt_duration_seconds
            .with_label_values(&[stage])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a cache lookup. `tier` is `None` on a miss.
    pub fn record_cache_lookup(&self, tier: Option<CacheTier>) {
        let (tier, outcome) = match tier {
            Some(tier) => (tier.as_str(), "hit"),
            None => ("none", "miss"),
        };
        self.cache_lookups_total
            .with_label_values(&[tier, outcome])
            .inc();
    }

    /// Record one sanitizer pass.
    pub fn record_sanitize(&self, mode: SanitizeMode, report: &SanitizeReport) {
        let mode = mode.as_str();
        self.sanitizer_declarations_total
            .with_label_values(&[mode, "parsed"])
            .inc_by(report.parsed as f64);
        self.sanitizer_declarations_total
            .with_label_values(&[mode, "kept"])
            .inc_by(report.kept as f64);
        for (reason, count) in &report.dropped {
            self.sanitizer_drops_total
                .with_label_values(&[reason.as_str()])
                .inc_by(*count as f64);
        }
    }

    /// Record a font resolution.
    pub fn record_font_resolution(&self, faces: usize, failed: bool) {
        let outcome = match (failed, faces) {
            (true, _) => "failed",
            (false, 0) => "empty",
            (false, _) => "resolved",
        };
        self.font_resolutions_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Publish replica row counts after a snapshot.
    pub fn set_replica_status(&self, status: &ReplicaStatus) {
        self.replica_keys.set(status.key_count as f64);
        self.replica_quotas.set(status.quota_count as f64);
        self.replica_last_update.set(status.last_update as f64);
    }

    /// Record a snapshot feed event (connected, disconnected, applied, ...).
    pub fn record_feed_event(&self, event: &str) {
        self.snapshot_feed_events_total
            .with_label_values(&[event])
            .inc();
    }

    /// Record a bearer auth decision.
    pub fn record_auth_decision(&self, outcome: &str) {
        self.auth_decisions_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record a usage sink failure.
    pub fn record_usage_failure(&self, reason: &str) {
        self.usage_record_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Publish memory tier occupancy.
    pub fn set_cache_stats(&self, stats: &CacheStats) {
        self.cache_memory_entries.set(stats.entry_count as f64);
        self.cache_memory_bytes.set(stats.memory_bytes as f64);
    }
}

/// Bridges render pipeline events into [`METRICS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl RenderObserver for MetricsObserver {
    fn sanitized(&self, mode: SanitizeMode, report: &SanitizeReport) {
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.record_sanitize(mode, report);
        }
    }

    fn fonts_resolved(&self, faces: usize, failed: bool) {
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.record_font_resolution(faces, failed);
        }
    }

    fn attempt(&self, stage: &'static str, outcome: AttemptOutcome, elapsed: Duration) {
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.record_render_attempt(stage, outcome, elapsed);
        }
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htmlshot_render::{DropReason, FailureKind};
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_record_http_request() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_http_request("GET", "/v1/image", 200, 0.015);
        let count = metrics
            .http_requests_total
            .with_label_values(&["GET", "/v1/image", "200"])
            .get();
        assert!(count >= 1.0);
        Ok(())
    }

    #[test]
    fn test_render_attempt_labels() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_render_attempt(
            "strict",
            AttemptOutcome::Failure(FailureKind::Style),
            Duration::from_millis(12),
        );
        let count = metrics
            .render_attempts_total
            .with_label_values(&["strict", FailureKind::Style.as_str()])
            .get();
        assert!(count >= 1.0);
        Ok(())
    }

    #[test]
    fn test_sanitize_report_counts() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        let before = metrics
            .sanitizer_drops_total
            .with_label_values(&[DropReason::DataUrl.as_str()])
            .get();

        let mut report = SanitizeReport {
            parsed: 3,
            kept: 1,
            ..Default::default()
        };
        report.record_drop(DropReason::DataUrl);
        report.record_drop(DropReason::DataUrl);
        MetricsObserver.sanitized(SanitizeMode::Standard, &report);

        let after = metrics
            .sanitizer_drops_total
            .with_label_values(&[DropReason::DataUrl.as_str()])
            .get();
        assert!(after - before >= 2.0);
        Ok(())
    }

    #[test]
    fn test_replica_gauges() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.set_replica_status(&ReplicaStatus {
            last_update: 3,
            key_count: 7,
            quota_count: 5,
            updated_at: None,
        });
        assert_eq!(metrics.replica_keys.get(), 7.0);
        assert_eq!(metrics.replica_quotas.get(), 5.0);
        Ok(())
    }

    #[test]
    fn test_cache_lookup_miss_label() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_cache_lookup(None);
        metrics.record_cache_lookup(Some(CacheTier::Memory));
        assert!(
            metrics
                .cache_lookups_total
                .with_label_values(&["none", "miss"])
                .get()
                >= 1.0
        );
        Ok(())
    }
}
