//! htmlshot Telemetry - Observability Infrastructure
//!
//! Structured JSON logging through `tracing` and Prometheus metrics for the
//! API layer and the render pipeline it drives.

pub mod metrics;
pub mod middleware;
pub mod tracer;

pub use metrics::{metrics_handler, HtmlshotMetrics, MetricsObserver, METRICS};
pub use middleware::observability_middleware;
pub use tracer::{init_tracer, TelemetryConfig};
