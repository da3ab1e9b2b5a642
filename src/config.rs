//! Configuration management for imgopt.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `IMGOPT_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `IMGOPT_HOST` - Server bind address (default: 0.0.0.0)
//! - `IMGOPT_PORT` - Server port (default: 3000)
//! - `IMGOPT_S3_BUCKET` - S3 bucket for optimized artifacts (required)
//! - `IMGOPT_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `IMGOPT_S3_REGION` - AWS region (default: us-east-1)
//! - `IMGOPT_S3_CUSTOM_DOMAIN` - Base URL joined with minted keys
//! - `IMGOPT_DEFAULT_TTL` - Request context TTL in seconds (default: 3600)
//! - `IMGOPT_CLEANUP_INTERVAL` - Sweep interval in milliseconds (default: 300000)
//! - `IMGOPT_MAX_FILE_SIZE` - Single-upload byte limit (default: 50 MB)
//! - `IMGOPT_DEFAULT_QUALITY` - Default encode quality (default: 80)
//! - `IMGOPT_QUEUE_CONCURRENCY` - Worker pool size (default: 4)
//! - `IMGOPT_MAX_RETRIES` - Blob upload attempts (default: 3)

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::pool::{DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_THREADS, DEFAULT_MIN_THREADS};
use crate::store::{DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS};
use crate::transform::DEFAULT_QUALITY;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default single-upload size limit: 50 MB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 52_428_800;

/// Default per-file size limit in batch uploads: 10 MB.
pub const DEFAULT_BATCH_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default maximum number of files per batch.
pub const DEFAULT_MAX_BATCH_FILES: usize = 10;

/// Default cleanup sweep interval in milliseconds.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = DEFAULT_SWEEP_INTERVAL_SECS * 1000;

/// Default temp directory for inbound uploads.
pub const DEFAULT_TEMP_DIR: &str = "/tmp/imgopt-uploads";

/// Default blob upload attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// =============================================================================
// CLI Arguments
// =============================================================================

/// imgopt - asynchronous image optimization service.
///
/// Accepts image uploads over HTTP, immediately returns the destination URL
/// of the optimized artifact, and runs the CPU-bound optimization on a
/// bounded worker pool. Completion is pushed to webhook callbacks and an SSE
/// stream; artifacts are uploaded to S3 or S3-compatible storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "imgopt")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "IMGOPT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "IMGOPT_PORT")]
    pub port: u16,

    // =========================================================================
    // S3 Configuration
    // =========================================================================
    /// S3 bucket receiving optimized artifacts.
    #[arg(long, env = "IMGOPT_S3_BUCKET")]
    pub s3_bucket: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "IMGOPT_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "IMGOPT_S3_REGION")]
    pub s3_region: String,

    /// Base URL (CDN or origin) joined with minted keys to form download
    /// URLs returned to clients.
    #[arg(long, default_value = "", env = "IMGOPT_S3_CUSTOM_DOMAIN")]
    pub s3_custom_domain: String,

    // =========================================================================
    // Context Store Configuration
    // =========================================================================
    /// TTL in seconds for per-request contexts. Must exceed the expected
    /// maximum processing time.
    #[arg(long, default_value_t = DEFAULT_TTL_SECS, env = "IMGOPT_DEFAULT_TTL")]
    pub default_ttl: u64,

    /// TTL in seconds for client contexts.
    #[arg(long, default_value_t = DEFAULT_TTL_SECS, env = "IMGOPT_CLIENT_CONTEXT_TTL")]
    pub client_context_ttl: u64,

    /// Cleanup sweep interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_MS, env = "IMGOPT_CLEANUP_INTERVAL")]
    pub cleanup_interval: u64,

    // =========================================================================
    // Upload Configuration
    // =========================================================================
    /// Maximum single-upload size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE, env = "IMGOPT_MAX_FILE_SIZE")]
    pub max_file_size: u64,

    /// Directory for inbound upload temp files.
    #[arg(long, default_value = DEFAULT_TEMP_DIR, env = "IMGOPT_TEMP_DIR")]
    pub temp_dir: PathBuf,

    // =========================================================================
    // Optimization Configuration
    // =========================================================================
    /// Default encode quality (1-100).
    #[arg(long, default_value_t = DEFAULT_QUALITY, env = "IMGOPT_DEFAULT_QUALITY")]
    pub default_quality: u8,

    /// Maximum worker threads for CPU-bound image work.
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS, env = "IMGOPT_QUEUE_CONCURRENCY")]
    pub queue_concurrency: usize,

    /// Minimum worker threads kept alive.
    #[arg(long, default_value_t = DEFAULT_MIN_THREADS, env = "IMGOPT_MIN_THREADS")]
    pub min_threads: usize,

    /// Idle timeout in milliseconds before surplus workers exit.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_MS, env = "IMGOPT_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Blob upload attempts before a task is marked failed.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "IMGOPT_MAX_RETRIES")]
    pub max_retries: u32,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Sustained requests per second admitted by the token bucket.
    /// Zero disables rate limiting.
    #[arg(long, default_value_t = 0, env = "IMGOPT_RATE_LIMIT")]
    pub rate_limit: u32,

    /// Token bucket burst capacity.
    #[arg(long, default_value_t = 30, env = "IMGOPT_RATE_LIMIT_BURST")]
    pub rate_limit_burst: u32,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated). Unset allows any origin.
    #[arg(long, env = "IMGOPT_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.s3_bucket.is_empty() {
            return Err(
                "S3 bucket name is required. Set --s3-bucket or IMGOPT_S3_BUCKET".to_string(),
            );
        }

        if self.default_quality == 0 || self.default_quality > 100 {
            return Err("default_quality must be between 1 and 100".to_string());
        }

        if self.queue_concurrency == 0 {
            return Err("queue_concurrency must be greater than 0".to_string());
        }
        let cpu_cap = num_cpus::get() * 4;
        if self.queue_concurrency > cpu_cap {
            return Err(format!(
                "queue_concurrency {} exceeds sane bound {} (4x logical CPUs)",
                self.queue_concurrency, cpu_cap
            ));
        }
        if self.min_threads > self.queue_concurrency {
            return Err("min_threads must not exceed queue_concurrency".to_string());
        }

        if self.default_ttl == 0 {
            return Err("default_ttl must be greater than 0".to_string());
        }
        if self.cleanup_interval == 0 {
            return Err("cleanup_interval must be greater than 0".to_string());
        }

        if self.max_file_size == 0 {
            return Err("max_file_size must be greater than 0".to_string());
        }

        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }

        if self.rate_limit > 0 && self.rate_limit_burst == 0 {
            return Err("rate_limit_burst must be greater than 0 when rate limiting".to_string());
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Context TTL as a duration.
    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    /// Cleanup sweep interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval)
    }

    /// Worker idle timeout as a duration.
    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }
}

// =============================================================================
// Tests
// =============================================================================
