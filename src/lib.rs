//! imgopt - an asynchronous image optimization service.
//!
//! This library provides the core of an HTTP service that accepts image
//! uploads, immediately returns the destination URL of the optimized
//! artifact, and runs the CPU-bound optimization on a bounded worker pool.
//! Completion is fanned out to webhook callbacks and Server-Sent-Events
//! subscribers; artifacts land in S3-compatible object storage.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod pool;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use cleanup::CleanupScheduler;
pub use config::Config;
pub use error::{AcceptError, PoolError, TransformError, UploadError};
pub use events::{OptimizationEvent, SseBroker, SubscribeError};
pub use notify::{parse_callbacks, CallbackMethod, CallbackNotifier, CallbackSink};
pub use pool::{OptimizeTask, PoolConfig, PoolStats, TaskOutcome, WorkerPool};
pub use server::{create_router, AppState, RouterConfig, SurfaceLimits};
pub use service::{
    join_download_url, mint_destination_path, parse_output_format, validate_options,
    AcceptedBatch, AcceptedBatchItem, AcceptedOptimization, OptimizationService, ServiceConfig,
};
pub use storage::{create_s3_client, BlobSink, S3BlobSink};
pub use store::{
    ContextRegistry, RequestContext, Stored, StoredUpload, TtlStore, CONTROLLER_PARAMS,
};
pub use transform::{
    EncodedFormat, ImageMetadata, ImageOptimizer, OptimizeOptions, OptimizedImage, OutputFormat,
    PlaceholderImage, PlaceholderOptions, WatermarkOptions, DEFAULT_QUALITY, MAX_DIMENSION,
    SUPPORTED_OUTPUT_FORMATS,
};
