//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use htmlshot_storage::{AuthReplica, TieredCache};

use crate::services::ImageService;

/// Application-wide state shared across all routes.
///
/// Every component is built once in `main` and shared by handle.
#[derive(Clone)]
pub struct AppState {
    /// Mint and serve orchestration.
    pub images: Arc<ImageService>,
    /// Bearer key and quota facts. Written only by the snapshot feed.
    pub replica: Arc<AuthReplica>,
    /// Same cache the image service writes; held here for health reporting.
    pub cache: Arc<TieredCache>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        images: Arc<ImageService>,
        replica: Arc<AuthReplica>,
        cache: Arc<TieredCache>,
    ) -> Self {
        Self {
            images,
            replica,
            cache,
            start_time: Instant::now(),
        }
    }
}

impl_from_ref!(Arc<ImageService>, images);
impl_from_ref!(Arc<AuthReplica>, replica);
impl_from_ref!(Arc<TieredCache>, cache);
