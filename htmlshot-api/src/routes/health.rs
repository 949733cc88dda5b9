//! Health Check Endpoints
//!
//! - /health/ping - Simple liveness check
//! - /health/live - Process alive check
//! - /health/ready - Auth replica has applied at least one snapshot
//!
//! No authentication required for health endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use htmlshot_core::Timestamp;
use htmlshot_storage::{AuthReplica, CacheStats, ReplicaStatus, TieredCache};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub replica: ReplicaHealth,
    pub cache: CacheHealth,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaHealth {
    pub status: HealthStatus,
    pub last_update: u64,
    pub key_count: u64,
    pub quota_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl From<&ReplicaStatus> for ReplicaHealth {
    fn from(status: &ReplicaStatus) -> Self {
        Self {
            status: if status.is_ready() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            last_update: status.last_update,
            key_count: status.key_count,
            quota_count: status.quota_count,
            updated_at: status.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealth {
    pub entries: u64,
    pub memory_bytes: u64,
    pub hit_rate: f64,
    pub disk_write_failures: u64,
}

impl From<&CacheStats> for CacheHealth {
    fn from(stats: &CacheStats) -> Self {
        Self {
            entries: stats.entry_count,
            memory_bytes: stats.memory_bytes,
            hit_rate: stats.hit_rate(),
            disk_write_failures: stats.disk_write_failures,
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone)]
pub struct HealthState {
    pub replica: Arc<AuthReplica>,
    pub cache: Arc<TieredCache>,
    pub start_time: Instant,
}

impl From<&AppState> for HealthState {
    fn from(state: &AppState) -> Self {
        Self {
            replica: state.replica.clone(),
            cache: state.cache.clone(),
            start_time: state.start_time,
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple pong response
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/live - Process liveness check
pub async fn liveness() -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Process is alive".to_string()),
        details: None,
    };
    (StatusCode::OK, Json(response))
}

/// GET /health/ready - Readiness check (auth replica populated)
///
/// Disk write failures degrade but do not fail readiness; the memory tier
/// still serves.
pub async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let replica = ReplicaHealth::from(&state.replica.status());
    let cache = CacheHealth::from(&state.cache.stats());

    let overall_status = if replica.status != HealthStatus::Healthy {
        HealthStatus::Unhealthy
    } else if cache.disk_write_failures > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let message = match overall_status {
        HealthStatus::Unhealthy => Some("Waiting for first auth snapshot".to_string()),
        HealthStatus::Degraded => Some("Disk cache writes are failing".to_string()),
        HealthStatus::Healthy => None,
    };

    let response = HealthResponse {
        status: overall_status,
        message,
        details: Some(HealthDetails {
            replica,
            cache,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
        }),
    };

    let status_code = if overall_status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(response))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router (no auth required)
pub fn create_router<S: Clone + Send + Sync + 'static>(state: &AppState) -> Router<S> {
    let state = Arc::new(HealthState::from(state));

    Router::new()
        .route("/ping", get(ping))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .with_state(state)
}
