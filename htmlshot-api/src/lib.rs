//! htmlshot API - HTTP Surface for the Image Service
//!
//! Exposes two image endpoints over Axum:
//!
//! - `POST /v1/image/mint` turns a template id and variables into a signed,
//!   expiring URL for an authorized API key.
//! - `GET /v1/image` verifies that URL, answers from the tiered cache when
//!   it can, and otherwise renders through the executor cascade.
//!
//! Bearer keys and quotas are checked against a local LMDB replica that a
//! background job keeps in sync with the origin service.

#[macro_use]
pub mod macros;

pub mod config;
pub mod constants;
pub mod error;
pub mod jobs;
pub mod middleware;
pub mod providers;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::{
    CacheConfig, FontConfig, OriginConfig, QuotaSource, ReconnectConfig, RenderConfig,
    ReplicaConfig, ServerConfig, ServiceConfig, SigningConfig,
};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{spawn_snapshot_feed, SnapshotFeedConfig};
pub use middleware::{auth_middleware, bearer_token, AuthExtractor};
pub use providers::OriginClient;
pub use routes::create_api_router;
pub use services::{ImageService, ImageServiceConfig, MintRequest, MintResponse, ServeOutcome};
pub use state::AppState;
