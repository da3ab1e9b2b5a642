//! HTTP surface.
//!
//! A thin layer over the orchestrator: parameter validation, multipart
//! parsing to temp files, response serialization, SSE subscription, and the
//! router wiring (CORS, tracing, body limits, rate limiting).

mod handlers;
mod ratelimit;
mod routes;
mod sse;

pub use handlers::{
    batch_optimize_handler, blur_placeholder_handler, download_handler, health_handler,
    optimize_handler, stats_handler, AppState, BatchOptimizeResponse, BatchResponseItem,
    ErrorResponse, HealthResponse, OptimizeQueryParams, OptimizeResponse, PlaceholderQueryParams,
    PlaceholderResponse, StatsResponse, SurfaceLimits, DEFAULT_OPTIMIZE_WIDTH,
};
pub use ratelimit::{rate_limit_middleware, RateLimiter};
pub use routes::{create_router, RouterConfig};
pub use sse::sse_subscribe_handler;
