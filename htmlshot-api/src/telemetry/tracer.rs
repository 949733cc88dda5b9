//! Tracing Subscriber Initialization
//!
//! Installs a JSON formatter behind an `EnvFilter`. `RUST_LOG` overrides the
//! configured default filter when present.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

const DEFAULT_LOG_FILTER: &str =
    "htmlshot_api=debug,htmlshot_render=info,htmlshot_storage=info,tower_http=info,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Enable metrics collection
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("HTMLSHOT_SERVICE_NAME")
                .unwrap_or_else(|_| "htmlshot-api".to_string()),
            service_version: std::env::var("HTMLSHOT_SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            environment: std::env::var("HTMLSHOT_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            log_filter: std::env::var("HTMLSHOT_LOG_FILTER")
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            metrics_enabled: std::env::var("HTMLSHOT_METRICS_ENABLED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(true),
        }
    }
}

/// Initialize the tracing subscriber.
///
/// Call once at startup before any tracing occurs. A second call fails
/// because a global subscriber is already installed.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = config.service_name,
        service_version = config.service_version,
        environment = config.environment,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );

    Ok(())
}
