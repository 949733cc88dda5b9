//! Shared harness for htmlshot-api integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, Response};
use axum::Router;
use htmlshot_api::{create_api_router, AppState, ImageService, ImageServiceConfig, ServerConfig};
use htmlshot_render::{ExecutorConfig, RenderExecutor};
use htmlshot_storage::{AuthReplica, DiskTier, MemoryTier, TieredCache};
use htmlshot_test_utils::fixtures::{card_template, signer, snapshot_for, TEST_API_KEY, TEST_USER};
use htmlshot_test_utils::{
    InMemoryTemplates, MockCompositor, RecordingUsageSink, StaticFonts, StaticQuota,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PUBLIC_BASE_URL: &str = "http://img.test";
pub const CARD_ID: &str = "card";

pub struct TestApp {
    pub router: Router,
    pub compositor: Arc<MockCompositor>,
    pub templates: Arc<InMemoryTemplates>,
    pub quota: Arc<StaticQuota>,
    pub usage: Arc<RecordingUsageSink>,
    pub replica: Arc<AuthReplica>,
    pub cache: Arc<TieredCache>,
    _dir: TempDir,
}

impl TestApp {
    /// App with a public `card` template owned by the test user.
    pub fn new() -> Result<Self, String> {
        Self::with_compositor(MockCompositor::new())
    }

    pub fn with_compositor(compositor: MockCompositor) -> Result<Self, String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let compositor = Arc::new(compositor);
        let templates = Arc::new(InMemoryTemplates::with([card_template(CARD_ID, TEST_USER)]));
        let quota = Arc::new(StaticQuota::allow());
        let usage = Arc::new(RecordingUsageSink::new());

        let replica = Arc::new(
            AuthReplica::open(dir.path().join("replica"), 16).map_err(|e| e.to_string())?,
        );
        let disk = DiskTier::new(dir.path().join("cache"), None).map_err(|e| e.to_string())?;
        let cache = Arc::new(TieredCache::new(MemoryTier::new(64, None), disk));

        let executor = RenderExecutor::new(
            compositor.clone(),
            Arc::new(StaticFonts::empty()),
            ExecutorConfig {
                attempt_timeout: Duration::from_secs(5),
                max_concurrent_renders: 2,
            },
        );

        let images = Arc::new(ImageService::new(
            signer(),
            cache.clone(),
            Arc::new(executor),
            templates.clone(),
            quota.clone(),
            usage.clone(),
            ImageServiceConfig {
                public_base_url: PUBLIC_BASE_URL.to_string(),
                default_ttl: Duration::from_secs(3600),
                max_ttl: Duration::from_secs(86_400),
                max_width: 2000,
                max_height: 2000,
            },
        ));

        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            public_base_url: PUBLIC_BASE_URL.to_string(),
            cors_origins: Vec::new(),
            mint_timeout: Duration::from_secs(5),
            max_in_flight: 64,
        };
        let state = AppState::new(images, replica.clone(), cache.clone());
        let router = create_api_router(state, &server);

        Ok(Self {
            router,
            compositor,
            templates,
            quota,
            usage,
            replica,
            cache,
            _dir: dir,
        })
    }

    /// Grant the test key with `usage` of `limit` renders spent.
    pub fn load_snapshot(&self, limit: u64, usage: u64) -> Result<(), String> {
        self.replica
            .apply_snapshot(&snapshot_for(TEST_API_KEY, TEST_USER, limit, usage))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>, String> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Body>, String> {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        self.send(request).await
    }

    pub async fn mint(&self, body: serde_json::Value) -> Result<Response<Body>, String> {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/image/mint")
            .header(header::AUTHORIZATION, format!("Bearer {}", TEST_API_KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|e| e.to_string())?;
        self.send(request).await
    }

    /// Mint `body` and return the path + query of the signed URL.
    pub async fn mint_path(&self, body: serde_json::Value) -> Result<String, String> {
        let response = self.mint(body).await?;
        if !response.status().is_success() {
            return Err(format!("mint failed with {}", response.status()));
        }
        let json = json_body(response).await?;
        let url = json["url"].as_str().ok_or("url missing")?;
        url.strip_prefix(PUBLIC_BASE_URL)
            .map(str::to_string)
            .ok_or_else(|| format!("unexpected url {}", url))
    }
}

pub async fn body_bytes(response: Response<Body>) -> Result<Vec<u8>, String> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .map(|b| b.to_vec())
        .map_err(|e| e.to_string())
}

pub async fn json_body(response: Response<Body>) -> Result<serde_json::Value, String> {
    let bytes = body_bytes(response).await?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

pub fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}
