//! htmlshot API Server Entry Point
//!
//! Bootstraps configuration, opens the cache and auth replica, starts the
//! background jobs and serves the Axum router until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use htmlshot_core::{QuotaDecision, Signer, TemplateProvider, UsageSink};
use htmlshot_render::{CommandCompositor, ExecutorConfig, FontResolver, RenderExecutor};
use htmlshot_storage::{spawn_sweepers, AuthReplica, DiskTier, MemoryTier, SweepConfig, TieredCache};
use tokio::sync::watch;

use htmlshot_api::telemetry::{init_tracer, MetricsObserver, TelemetryConfig};
use htmlshot_api::{
    create_api_router, spawn_snapshot_feed, ApiError, ApiResult, AppState, ImageService,
    ImageServiceConfig, OriginClient, QuotaSource, ServerConfig, ServiceConfig,
    SnapshotFeedConfig,
};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let config = ServiceConfig::from_env()?;
    config.validate()?;
    tracing::info!(environment = %config.environment, "Loaded service configuration");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signer = Signer::new(&config.signing.secret)?;

    let fonts = FontResolver::new(config.fonts.clone())
        .map_err(|e| ApiError::internal_error(format!("Failed to build font resolver: {}", e)))?;
    let compositor = CommandCompositor::new(config.render.command.clone(), config.render.args.clone());
    let executor = RenderExecutor::new(
        Arc::new(compositor),
        Arc::new(fonts),
        ExecutorConfig {
            attempt_timeout: config.render.attempt_timeout,
            max_concurrent_renders: config.render.max_concurrent_renders,
        },
    )
    .with_observer(Arc::new(MetricsObserver));

    let memory = MemoryTier::new(config.cache.memory_capacity, config.cache.memory_ttl);
    let disk = DiskTier::new(&config.cache.disk_dir, config.cache.disk_ttl)
        .map_err(|e| ApiError::internal_error(format!("Failed to open disk cache: {}", e)))?;
    let cache = Arc::new(TieredCache::new(memory, disk));

    let replica = Arc::new(
        AuthReplica::open(&config.replica.path, config.replica.map_size_mb)
            .map_err(|e| ApiError::internal_error(format!("Failed to open auth replica: {}", e)))?,
    );

    let origin = Arc::new(OriginClient::new(&config.origin)?);
    let quota: Arc<dyn QuotaDecision> = match config.origin.quota_source {
        QuotaSource::Replica => replica.clone(),
        QuotaSource::Origin => origin.clone(),
    };
    let templates: Arc<dyn TemplateProvider> = origin.clone();
    let usage: Arc<dyn UsageSink> = origin;

    let images = Arc::new(ImageService::new(
        signer,
        cache.clone(),
        Arc::new(executor),
        templates,
        quota,
        usage,
        ImageServiceConfig {
            public_base_url: config.server.public_base_url.clone(),
            default_ttl: config.signing.default_ttl,
            max_ttl: config.signing.max_ttl,
            max_width: config.render.max_width,
            max_height: config.render.max_height,
        },
    ));

    let mut jobs = spawn_sweepers(
        cache.clone(),
        SweepConfig {
            memory_interval: config.cache.memory_sweep_interval,
            disk_interval: config.cache.disk_sweep_interval,
        },
        shutdown_rx.clone(),
    );

    match config.replica.feed_url.clone() {
        Some(url) => jobs.push(spawn_snapshot_feed(
            replica.clone(),
            SnapshotFeedConfig {
                url,
                token: config.replica.feed_token.clone(),
                reconnect: config.replica.reconnect.clone(),
            },
            shutdown_rx.clone(),
        )),
        None => tracing::warn!(
            "HTMLSHOT_SNAPSHOT_FEED_URL not set; bearer requests stay NOT_READY until a snapshot arrives"
        ),
    }

    let state = AppState::new(images, replica, cache);
    let app = create_api_router(state, &config.server);

    let addr = resolve_bind_addr(&config.server)?;
    tracing::info!(%addr, "Starting htmlshot API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "Background job ended abnormally");
        }
    }

    Ok(())
}

fn resolve_bind_addr(config: &ServerConfig) -> ApiResult<SocketAddr> {
    format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            ApiError::internal_error(format!(
                "Invalid bind address {}:{}: {}",
                config.host, config.port, e
            ))
        })
}
