//! Optimization orchestrator.
//!
//! The service implements the immediate-response dispatch protocol:
//!
//! 1. Validate parameters and mint the destination key.
//! 2. Persist the full request context under a fresh optimization id.
//! 3. Return the predicted download URL synchronously.
//! 4. Asynchronously: read the upload, run the worker pool, upload the
//!    artifact, then fan out completion over SSE and webhooks.
//!
//! The context write happens-before the response; the response
//! happens-before any worker reads the context. After the response is
//! committed, failures are surfaced exclusively through SSE `error` events
//! and `status=error` callbacks.

mod path_minter;

pub use path_minter::{mint_destination_path, DESTINATION_PREFIX};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{AcceptError, TransformError, UploadError};
use crate::events::{OptimizationEvent, SseBroker};
use crate::notify::{CallbackNotifier, CallbackSink};
use crate::pool::{OptimizeTask, TaskOutcome, WorkerPool};
use crate::storage::BlobSink;
use crate::store::{ContextRegistry, RequestContext, StoredUpload};
use crate::transform::{
    ImageOptimizer, OptimizeOptions, PlaceholderImage, PlaceholderOptions, MAX_DIMENSION,
    SUPPORTED_OUTPUT_FORMATS,
};

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator wiring parameters.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URL (CDN/origin) joined with minted keys to form download URLs
    pub download_base: String,

    /// TTL applied to stored request contexts
    pub context_ttl: Duration,

    /// Blob upload attempts before giving up
    pub upload_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            download_base: String::new(),
            context_ttl: Duration::from_secs(crate::store::DEFAULT_TTL_SECS),
            upload_attempts: 3,
        }
    }
}

// =============================================================================
// Accept Results
// =============================================================================

/// Synchronous response of the single-image accept path.
#[derive(Debug, Clone)]
pub struct AcceptedOptimization {
    pub optimization_id: String,
    pub new_file_path: String,
    pub download_url: String,
    pub original_size: u64,
    pub callbacks_scheduled: usize,
}

/// One accepted file within a batch.
#[derive(Debug, Clone)]
pub struct AcceptedBatchItem {
    pub original_name: String,
    pub new_file_path: String,
    pub download_url: String,
    pub original_size: u64,
}

/// Synchronous response of the batch accept path.
#[derive(Debug, Clone)]
pub struct AcceptedBatch {
    pub optimization_id: String,
    pub callbacks_scheduled: usize,
    pub items: Vec<AcceptedBatchItem>,
}

// =============================================================================
// Completion Payloads
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SinglePayload<'a> {
    optimization_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a str>,
    original_name: &'a str,
    original_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    optimized_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchPayload {
    optimization_id: String,
    status: String,
    total_files: usize,
    successful_files: usize,
    failed_files: usize,
    results: Vec<BatchResultPayload>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResultPayload {
    original_name: String,
    success: bool,
    original_size: u64,
    optimized_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// =============================================================================
// Optimization Service
// =============================================================================

/// Entry point invoked by the HTTP layer.
///
/// Owns a one-way dependency graph: the service pushes into the registry,
/// pool, broker, notifier and sink; none of them reach back up. Cloning
/// shares the underlying state; the asynchronous arm holds a clone for the
/// lifetime of each task.
#[derive(Clone)]
pub struct OptimizationService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    registry: Arc<ContextRegistry<RequestContext>>,
    pool: Arc<WorkerPool>,
    broker: Arc<SseBroker>,
    notifier: CallbackNotifier,
    sink: Arc<dyn BlobSink>,
    optimizer: ImageOptimizer,
    config: ServiceConfig,
}

impl OptimizationService {
    pub fn new(
        registry: Arc<ContextRegistry<RequestContext>>,
        pool: Arc<WorkerPool>,
        broker: Arc<SseBroker>,
        notifier: CallbackNotifier,
        sink: Arc<dyn BlobSink>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                pool,
                broker,
                notifier,
                sink,
                optimizer: ImageOptimizer::new(),
                config,
            }),
        }
    }

    /// The context registry backing this service.
    pub fn registry(&self) -> &Arc<ContextRegistry<RequestContext>> {
        &self.inner.registry
    }

    /// The worker pool backing this service.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    // =========================================================================
    // Accept: single
    // =========================================================================

    /// Accept a single-image optimization.
    ///
    /// On success the context is persisted and the asynchronous arm is
    /// dispatched; the returned record carries everything the HTTP layer
    /// needs for the synchronous response.
    pub async fn accept_single(
        &self,
        upload: StoredUpload,
        callbacks: Vec<CallbackSink>,
        options: OptimizeOptions,
    ) -> Result<AcceptedOptimization, AcceptError> {
        validate_options(&options)?;
        self.inner.pool.check_capacity(1)?;

        let id = Uuid::new_v4().to_string();
        if self.inner.registry.has(&id).await {
            return Err(AcceptError::DuplicateId(id));
        }

        let new_file_path = mint_destination_path(options.format.as_str());
        let download_url = join_download_url(&self.inner.config.download_base, &new_file_path);
        let original_size = upload.size;
        let callbacks_scheduled = callbacks.len();

        let context = RequestContext {
            file: Some(upload),
            files: Vec::new(),
            options,
            callbacks,
            new_file_path: Some(new_file_path.clone()),
            new_file_paths: Vec::new(),
        };
        self.inner
            .registry
            .set_with_ttl(&id, context, self.inner.config.context_ttl)
            .await;

        debug!(id = %id, path = %new_file_path, "accepted optimization");

        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        tokio::spawn(async move {
            inner.run_single(task_id).await;
        });

        Ok(AcceptedOptimization {
            optimization_id: id,
            new_file_path,
            download_url,
            original_size,
            callbacks_scheduled,
        })
    }

    // =========================================================================
    // Accept: batch
    // =========================================================================

    /// Accept a batch optimization. One destination key is minted per file;
    /// a single consolidated callback fires when every file has settled.
    pub async fn accept_batch(
        &self,
        uploads: Vec<StoredUpload>,
        callbacks: Vec<CallbackSink>,
        options: OptimizeOptions,
    ) -> Result<AcceptedBatch, AcceptError> {
        if uploads.is_empty() {
            return Err(AcceptError::MissingFile("files"));
        }
        validate_options(&options)?;
        self.inner.pool.check_capacity(uploads.len())?;

        let id = Uuid::new_v4().to_string();
        if self.inner.registry.has(&id).await {
            return Err(AcceptError::DuplicateId(id));
        }

        let callbacks_scheduled = callbacks.len();
        let mut new_file_paths = Vec::with_capacity(uploads.len());
        let mut items = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            let path = mint_destination_path(options.format.as_str());
            items.push(AcceptedBatchItem {
                original_name: upload.original_name.clone(),
                new_file_path: path.clone(),
                download_url: join_download_url(&self.inner.config.download_base, &path),
                original_size: upload.size,
            });
            new_file_paths.push(path);
        }

        let context = RequestContext {
            file: None,
            files: uploads,
            options,
            callbacks,
            new_file_path: None,
            new_file_paths,
        };
        self.inner
            .registry
            .set_with_ttl(&id, context, self.inner.config.context_ttl)
            .await;

        debug!(id = %id, files = items.len(), "accepted batch optimization");

        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        tokio::spawn(async move {
            inner.run_batch(task_id).await;
        });

        Ok(AcceptedBatch {
            optimization_id: id,
            callbacks_scheduled,
            items,
        })
    }

    // =========================================================================
    // Blur placeholder (synchronous endpoint)
    // =========================================================================

    /// Generate a blur placeholder off the async runtime.
    pub async fn blur_placeholder(
        &self,
        source: Bytes,
        options: PlaceholderOptions,
    ) -> Result<PlaceholderImage, TransformError> {
        let optimizer = self.inner.optimizer.clone();
        tokio::task::spawn_blocking(move || optimizer.blur_placeholder(&source, &options))
            .await
            .map_err(|e| TransformError::Render(format!("placeholder task panicked: {}", e)))?
    }
}

impl ServiceInner {
    // =========================================================================
    // Asynchronous arm: single
    // =========================================================================

    async fn run_single(&self, id: String) {
        // Absence of the context here is a fatal processing error for this
        // task, never silent.
        let Some(stored) = self.registry.get(&id).await else {
            error!(id = %id, "context missing for in-flight optimization");
            self.publish_error(&id, "request context missing".to_string())
                .await;
            return;
        };
        let context = stored.value;
        let Some(upload) = context.file.clone() else {
            error!(id = %id, "single-image context has no file handle");
            self.fail_single(&id, &context, "request context has no file".to_string())
                .await;
            return;
        };

        self.broker
            .publish(OptimizationEvent::progress(&id, 10, "queued"))
            .await;

        let bytes = match tokio::fs::read(&upload.path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.fail_single(&id, &context, format!("failed to read upload: {}", e))
                    .await;
                return;
            }
        };

        self.broker
            .publish(OptimizationEvent::progress(&id, 30, "processing"))
            .await;

        let outcome = match self
            .pool
            .submit(OptimizeTask {
                bytes,
                options: context.options.clone(),
                original_name: upload.original_name.clone(),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_single(&id, &context, e.to_string()).await;
                return;
            }
        };

        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "optimization failed".to_string());
            self.fail_single(&id, &context, message).await;
            return;
        }

        self.broker
            .publish(OptimizationEvent::progress(&id, 80, "uploading"))
            .await;

        // The minted key is the upload key, verbatim.
        let key = context.new_file_path.clone().unwrap_or_default();
        let content_type = outcome
            .format
            .map(|f| f.mime_type().to_string())
            .unwrap_or_else(|| format!("image/{}", context.options.format.as_str()));

        if let Err(e) = self
            .upload_with_retry(outcome.bytes.clone(), &key, &content_type)
            .await
        {
            self.fail_single(&id, &context, format!("upload failed: {}", e))
                .await;
            return;
        }

        let download_url = join_download_url(&self.config.download_base, &key);
        let payload = serde_json::to_value(SinglePayload {
            optimization_id: &id,
            status: "success",
            download_url: Some(&download_url),
            data: Some(&key),
            original_name: &upload.original_name,
            original_size: outcome.original_size,
            optimized_size: Some(outcome.optimized_size),
            format: outcome.format.map(|f| f.as_str()),
            error: None,
        })
        .unwrap_or_default();

        self.broker
            .publish(OptimizationEvent::Complete {
                optimization_id: id.clone(),
                payload: payload.clone(),
            })
            .await;
        self.notifier.notify(&context.callbacks, &payload).await;

        debug!(id = %id, key = %key, "optimization complete");
    }

    /// Post-accept failure path: SSE `error`, then `status=error` callbacks.
    async fn fail_single(&self, id: &str, context: &RequestContext, message: String) {
        warn!(id = %id, error = %message, "optimization failed after accept");
        self.publish_error(id, message.clone()).await;

        let original_name = context
            .file
            .as_ref()
            .map(|f| f.original_name.as_str())
            .unwrap_or_default();
        let payload = serde_json::to_value(SinglePayload {
            optimization_id: id,
            status: "error",
            download_url: None,
            data: None,
            original_name,
            original_size: context.file.as_ref().map(|f| f.size).unwrap_or(0),
            optimized_size: None,
            format: None,
            error: Some(&message),
        })
        .unwrap_or_default();
        self.notifier.notify(&context.callbacks, &payload).await;
    }

    // =========================================================================
    // Asynchronous arm: batch
    // =========================================================================

    async fn run_batch(&self, id: String) {
        let Some(stored) = self.registry.get(&id).await else {
            error!(id = %id, "context missing for in-flight batch");
            self.publish_error(&id, "request context missing".to_string())
                .await;
            return;
        };
        let context = stored.value;
        let total = context.files.len();

        self.broker
            .publish(OptimizationEvent::progress(
                &id,
                10,
                format!("processing {} files", total),
            ))
            .await;

        // Read every upload; unreadable files become failed outcomes while
        // their siblings proceed.
        let mut pending: Vec<Option<OptimizeTask>> = Vec::with_capacity(total);
        let mut read_errors: Vec<Option<String>> = Vec::with_capacity(total);
        for upload in &context.files {
            match tokio::fs::read(&upload.path).await {
                Ok(bytes) => {
                    pending.push(Some(OptimizeTask {
                        bytes: Bytes::from(bytes),
                        options: context.options.clone(),
                        original_name: upload.original_name.clone(),
                    }));
                    read_errors.push(None);
                }
                Err(e) => {
                    pending.push(None);
                    read_errors.push(Some(format!("failed to read upload: {}", e)));
                }
            }
        }

        let tasks: Vec<OptimizeTask> = pending.iter_mut().filter_map(|t| t.take()).collect();
        let submitted = match self.pool.submit_many(tasks).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.fail_batch(&id, &context, e.to_string()).await;
                return;
            }
        };

        // Re-merge pool outcomes with read failures, preserving input order.
        let mut submitted = submitted.into_iter();
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(total);
        for (index, upload) in context.files.iter().enumerate() {
            match &read_errors[index] {
                Some(message) => outcomes.push(failed_outcome(upload, message.clone())),
                None => match submitted.next() {
                    Some(outcome) => outcomes.push(outcome),
                    None => outcomes.push(failed_outcome(
                        upload,
                        "worker outcome missing".to_string(),
                    )),
                },
            }
        }

        self.broker
            .publish(OptimizationEvent::progress(&id, 70, "uploading results"))
            .await;

        // Upload each success under a per-index key derived from the id.
        let mut results = Vec::with_capacity(total);
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let minted = context.new_file_paths.get(index).cloned();
            let mut entry = BatchResultPayload {
                original_name: outcome.original_name.clone(),
                success: outcome.success,
                original_size: outcome.original_size,
                optimized_size: outcome.optimized_size,
                data: minted.clone(),
                download_url: minted
                    .as_deref()
                    .map(|p| join_download_url(&self.config.download_base, p)),
                error: outcome.error.clone(),
            };

            if outcome.success {
                let key = format!("{}_{}", id, index);
                let content_type = outcome
                    .format
                    .map(|f| f.mime_type().to_string())
                    .unwrap_or_else(|| format!("image/{}", context.options.format.as_str()));
                if let Err(e) = self
                    .upload_with_retry(outcome.bytes.clone(), &key, &content_type)
                    .await
                {
                    warn!(id = %id, index, error = %e, "batch upload failed");
                    entry.success = false;
                    entry.error = Some(format!("upload failed: {}", e));
                    entry.download_url = None;
                }
            }

            self.broker
                .publish(OptimizationEvent::Progress {
                    optimization_id: id.clone(),
                    percent: (70 + (25 * (index + 1) / total.max(1))) as u8,
                    message: "file settled".to_string(),
                    current_file: Some(entry.original_name.clone()),
                    file_index: Some(index),
                })
                .await;

            results.push(entry);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let payload = serde_json::to_value(BatchPayload {
            optimization_id: id.clone(),
            status: if successful == total {
                "success".to_string()
            } else {
                "partial".to_string()
            },
            total_files: total,
            successful_files: successful,
            failed_files: total - successful,
            results,
        })
        .unwrap_or_default();

        self.broker
            .publish(OptimizationEvent::Complete {
                optimization_id: id.clone(),
                payload: payload.clone(),
            })
            .await;
        // One consolidated callback for the whole batch.
        self.notifier.notify(&context.callbacks, &payload).await;

        debug!(id = %id, total, successful, "batch complete");
    }

    async fn fail_batch(&self, id: &str, context: &RequestContext, message: String) {
        warn!(id = %id, error = %message, "batch failed after accept");
        self.publish_error(id, message.clone()).await;

        let payload = serde_json::to_value(BatchPayload {
            optimization_id: id.to_string(),
            status: "error".to_string(),
            total_files: context.files.len(),
            successful_files: 0,
            failed_files: context.files.len(),
            results: context
                .files
                .iter()
                .map(|f| BatchResultPayload {
                    original_name: f.original_name.clone(),
                    success: false,
                    original_size: f.size,
                    optimized_size: 0,
                    data: None,
                    download_url: None,
                    error: Some(message.clone()),
                })
                .collect(),
        })
        .unwrap_or_default();
        self.notifier.notify(&context.callbacks, &payload).await;
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    async fn publish_error(&self, id: &str, message: String) {
        self.broker
            .publish(OptimizationEvent::Error {
                optimization_id: id.to_string(),
                message,
            })
            .await;
    }

    async fn upload_with_retry(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<(), UploadError> {
        let attempts = self.config.upload_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.put(bytes.clone(), key, content_type).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(key = %key, attempt, error = %e, "blob upload failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn failed_outcome(upload: &StoredUpload, message: String) -> TaskOutcome {
    TaskOutcome {
        bytes: Bytes::new(),
        original_size: upload.size,
        optimized_size: 0,
        original_name: upload.original_name.clone(),
        format: None,
        success: false,
        error: Some(message),
    }
}

/// Join the configured download base with a minted key.
pub fn join_download_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return format!("/{}", path.trim_start_matches('/'));
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Validate option ranges at accept time.
pub fn validate_options(options: &OptimizeOptions) -> Result<(), AcceptError> {
    if let Some(width) = options.width {
        if width == 0 || width > MAX_DIMENSION {
            return Err(AcceptError::InvalidParameter {
                name: "width",
                message: format!("must be between 1 and {}, got {}", MAX_DIMENSION, width),
            });
        }
    }
    if let Some(height) = options.height {
        if height == 0 || height > MAX_DIMENSION {
            return Err(AcceptError::InvalidParameter {
                name: "height",
                message: format!("must be between 1 and {}, got {}", MAX_DIMENSION, height),
            });
        }
    }
    if options.quality == 0 || options.quality > 100 {
        return Err(AcceptError::InvalidParameter {
            name: "quality",
            message: format!("must be between 1 and 100, got {}", options.quality),
        });
    }
    if let Some(radius) = options.blur_radius {
        if radius == 0 || radius > 50 {
            return Err(AcceptError::InvalidParameter {
                name: "blurRadius",
                message: format!("must be between 1 and 50, got {}", radius),
            });
        }
    }
    Ok(())
}

/// Parse and validate an output format string, producing the client-facing
/// error that enumerates the supported set.
pub fn parse_output_format(raw: &str) -> Result<crate::transform::OutputFormat, AcceptError> {
    raw.parse().map_err(|_| AcceptError::UnsupportedFormat {
        format: raw.to_string(),
        supported: SUPPORTED_OUTPUT_FORMATS.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
