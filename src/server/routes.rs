//! Router configuration for the optimization API.
//!
//! # Route Structure
//!
//! ```text
//! /health                                       - Health check
//! /image-optimization/optimize                  - Single-image accept
//! /image-optimization/batch-optimize            - Batch accept
//! /image-optimization/blur-placeholder          - Inline placeholder
//! /image-optimization/download/{filename}       - Legacy local serve
//! /image-optimization/stats                     - Pool/store gauges
//! /image-optimization-sse/subscribe/{id}        - SSE event stream
//! ```

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    batch_optimize_handler, blur_placeholder_handler, download_handler, health_handler,
    optimize_handler, stats_handler, AppState,
};
use super::ratelimit::{rate_limit_middleware, RateLimiter};
use super::sse::sse_subscribe_handler;

/// Headroom added on top of the configured upload limits for multipart
/// framing overhead.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to enable request tracing
    pub enable_tracing: bool,

    /// Token bucket parameters `(rate, burst)`; None disables rate limiting
    pub rate_limit: Option<(u32, u32)>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Defaults: any origin, tracing on, no rate limit.
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            enable_tracing: true,
            rate_limit: None,
        }
    }

    /// Set specific allowed CORS origins.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Enable the token bucket with `rate` requests/second and `burst`
    /// capacity.
    pub fn with_rate_limit(mut self, rate: u32, burst: u32) -> Self {
        self.rate_limit = Some((rate, burst));
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
pub fn create_router(state: AppState, config: RouterConfig) -> Router {
    let body_limit = compute_body_limit(&state);
    let cors = build_cors_layer(&config);

    let mut api = Router::new()
        .route("/optimize", post(optimize_handler))
        .route("/batch-optimize", post(batch_optimize_handler))
        .route("/blur-placeholder", post(blur_placeholder_handler))
        .route("/download/{filename}", get(download_handler))
        .route("/stats", get(stats_handler));

    if let Some((rate, burst)) = config.rate_limit {
        let limiter = RateLimiter::new(rate, burst);
        api = api.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));
    }

    let router = Router::new()
        .nest("/image-optimization", api)
        .route(
            "/image-optimization-sse/subscribe/{id}",
            get(sse_subscribe_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Body limit covering the larger of the single and batch upload shapes.
fn compute_body_limit(state: &AppState) -> usize {
    let single = state.limits.max_file_size;
    let batch = state.limits.batch_file_size * state.limits.max_batch_files as u64;
    single.max(batch) as usize + BODY_LIMIT_SLACK
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
