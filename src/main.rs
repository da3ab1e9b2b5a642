//! imgopt - asynchronous image optimization service.
//!
//! This binary wires all components together and starts the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgopt::{
    cleanup::CleanupScheduler,
    config::Config,
    create_s3_client,
    pool::{PoolConfig, WorkerPool},
    server::{create_router, AppState, RouterConfig, SurfaceLimits},
    service::{OptimizationService, ServiceConfig},
    storage::S3BlobSink,
    store::{ContextRegistry, CONTROLLER_PARAMS},
    CallbackNotifier, SseBroker,
};

#[tokio::main]
async fn main() {
    // Parse configuration from CLI and environment
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("Starting imgopt");
    info!("  S3 bucket: {}", config.s3_bucket);
    if let Some(ref endpoint) = config.s3_endpoint {
        info!("  S3 endpoint: {}", endpoint);
    }
    info!("  Download base: {}", config.s3_custom_domain);
    info!(
        "  Workers: {}-{} (idle timeout {} ms)",
        config.min_threads, config.queue_concurrency, config.idle_timeout
    );
    info!(
        "  Context TTL: {} s, cleanup every {} ms",
        config.default_ttl, config.cleanup_interval
    );

    // Temp directory for inbound uploads
    if let Err(e) = tokio::fs::create_dir_all(&config.temp_dir).await {
        error!(
            "Failed to create temp directory {}: {}",
            config.temp_dir.display(),
            e
        );
        std::process::exit(1);
    }

    // Blob sink
    let s3_client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
    let sink = Arc::new(S3BlobSink::new(s3_client, config.s3_bucket.clone()));

    // Shared state: context registry, SSE broker, worker pool
    let registry = Arc::new(ContextRegistry::new(
        CONTROLLER_PARAMS,
        config.context_ttl(),
    ));
    // Client-facing event channels live as long as client contexts do.
    let broker = Arc::new(SseBroker::with_timings(
        Duration::from_secs(imgopt::events::DEFAULT_TERMINAL_GRACE_SECS),
        Duration::from_secs(config.client_context_ttl),
    ));
    let pool = Arc::new(WorkerPool::new(PoolConfig {
        min_threads: config.min_threads,
        max_threads: config.queue_concurrency,
        idle_timeout: config.worker_idle_timeout(),
        ..PoolConfig::default()
    }));

    // Orchestrator
    let service = Arc::new(OptimizationService::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&broker),
        CallbackNotifier::new(),
        sink,
        ServiceConfig {
            download_base: config.s3_custom_domain.clone(),
            context_ttl: config.context_ttl(),
            upload_attempts: config.max_retries,
        },
    ));

    // Cleanup scheduler: sweep contexts on the configured interval, orphans
    // after they outlive the TTL by a safety margin.
    let cleanup = CleanupScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&broker),
        config.temp_dir.clone(),
        config.cleanup_interval(),
        config.context_ttl() + Duration::from_secs(600),
    )
    .spawn();

    // Router
    let state = AppState::new(service, Arc::clone(&broker), build_limits(&config));
    let router = create_router(state, build_router_config(&config));

    // Bind and serve
    let addr = config.bind_address();
    info!("Listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Drain in-flight optimizations, then purge ephemeral state.
    info!("Shutting down: draining worker pool");
    pool.shutdown();
    pool.drained().await;
    cleanup.abort();
    registry.clear().await;

    if let Err(e) = serve_result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "imgopt=debug,tower_http=debug"
    } else {
        "imgopt=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build surface limits from the application Config.
fn build_limits(config: &Config) -> SurfaceLimits {
    let mut limits = SurfaceLimits::new(config.temp_dir.clone());
    limits.max_file_size = config.max_file_size;
    limits.default_quality = config.default_quality;
    limits
}

/// Build RouterConfig from the application Config.
fn build_router_config(config: &Config) -> RouterConfig {
    let mut router_config = RouterConfig::new().with_tracing(!config.no_tracing);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    if config.rate_limit > 0 {
        router_config = router_config.with_rate_limit(config.rate_limit, config.rate_limit_burst);
    }

    router_config
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
