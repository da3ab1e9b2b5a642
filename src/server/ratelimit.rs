//! Token-bucket rate limiting.
//!
//! A single process-wide bucket admits `rate` requests per second with a
//! configurable burst. Requests that find the bucket empty get a 429.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::handlers::ErrorResponse;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` requests/second with `burst`
    /// capacity. The bucket starts full.
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            })),
            rate: rate.max(1) as f64,
            burst,
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Axum middleware enforcing the bucket.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.try_acquire() {
        return next.run(request).await;
    }

    let body = ErrorResponse::with_status(
        "rate_limited",
        "too many requests, retry later",
        StatusCode::TOO_MANY_REQUESTS,
    );
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

// =============================================================================
// Tests
// =============================================================================
