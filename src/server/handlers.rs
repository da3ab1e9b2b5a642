//! HTTP request handlers for the optimization API.
//!
//! Handlers validate parameters, park multipart uploads in the temp
//! directory, and hand the request to the orchestrator. Everything returned
//! here is the *synchronous* half of the protocol; the asynchronous half is
//! observable via SSE and callbacks.
//!
//! # Endpoints
//!
//! - `POST /image-optimization/optimize` - single image
//! - `POST /image-optimization/batch-optimize` - up to 10 images
//! - `POST /image-optimization/blur-placeholder` - inline placeholder
//! - `GET  /image-optimization/download/{filename}` - legacy local serve
//! - `GET  /image-optimization/stats` - pool/store gauges
//! - `GET  /health` - health check

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_BATCH_FILE_SIZE, DEFAULT_MAX_BATCH_FILES, DEFAULT_MAX_FILE_SIZE};
use crate::error::{AcceptError, TransformError};
use crate::events::SseBroker;
use crate::notify::parse_callbacks;
use crate::service::{parse_output_format, OptimizationService};
use crate::store::StoredUpload;
use crate::transform::{OptimizeOptions, PlaceholderOptions, DEFAULT_QUALITY};

/// Default width bound applied when the query omits `width`.
pub const DEFAULT_OPTIMIZE_WIDTH: u32 = 800;

// =============================================================================
// Application State
// =============================================================================

/// Upload limits and filesystem wiring for the HTTP surface.
#[derive(Debug, Clone)]
pub struct SurfaceLimits {
    /// Single-upload byte limit (default 50 MB)
    pub max_file_size: u64,

    /// Per-file byte limit in batch uploads (default 10 MB)
    pub batch_file_size: u64,

    /// Maximum files per batch (default 10)
    pub max_batch_files: usize,

    /// Quality applied when the query omits `quality`
    pub default_quality: u8,

    /// Directory for inbound upload temp files
    pub temp_dir: PathBuf,

    /// Directory served by the legacy download endpoint
    pub download_dir: PathBuf,
}

impl SurfaceLimits {
    /// Limits with production defaults rooted at `temp_dir`.
    pub fn new(temp_dir: PathBuf) -> Self {
        let download_dir = temp_dir.join("optimized");
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            batch_file_size: DEFAULT_BATCH_FILE_SIZE,
            max_batch_files: DEFAULT_MAX_BATCH_FILES,
            default_quality: DEFAULT_QUALITY,
            temp_dir,
            download_dir,
        }
    }
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OptimizationService>,
    pub broker: Arc<SseBroker>,
    pub limits: Arc<SurfaceLimits>,
}

impl AppState {
    pub fn new(
        service: Arc<OptimizationService>,
        broker: Arc<SseBroker>,
        limits: SurfaceLimits,
    ) -> Self {
        Self {
            service,
            broker,
            limits: Arc::new(limits),
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Query parameters for the optimize endpoints.
#[derive(Debug, Deserialize)]
pub struct OptimizeQueryParams {
    /// Target width bound (default 800)
    #[serde(default)]
    pub width: Option<u32>,

    /// Target height bound (no default)
    #[serde(default)]
    pub height: Option<u32>,

    /// Encode quality (default 80)
    #[serde(default)]
    pub quality: Option<u8>,

    /// Output format (default jpeg)
    #[serde(default)]
    pub format: Option<String>,
}

/// Query parameters for the blur-placeholder endpoint.
#[derive(Debug, Deserialize)]
pub struct PlaceholderQueryParams {
    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    #[serde(default, rename = "blurRadius")]
    pub blur_radius: Option<u32>,

    #[serde(default)]
    pub quality: Option<u8>,

    #[serde(default, rename = "mobileOptimized")]
    pub mobile_optimized: Option<bool>,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g. "not_found", "invalid_parameter")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Response of the single-image optimize endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResponse {
    pub message: String,
    pub original_size: u64,
    /// The minted destination key
    pub data: String,
    pub download_url: String,
    pub callbacks_scheduled: usize,
    pub optimization_id: String,
}

/// One accepted file in the batch response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponseItem {
    pub original_name: String,
    pub data: String,
    pub download_url: String,
    pub original_size: u64,
}

/// Response of the batch optimize endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptimizeResponse {
    pub message: String,
    pub count: usize,
    pub callbacks_scheduled: usize,
    pub optimization_id: String,
    pub results: Vec<BatchResponseItem>,
}

/// Response of the blur-placeholder endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderResponse {
    pub message: String,
    /// Base64-encoded placeholder bytes
    pub data: String,
    pub width: u32,
    pub height: u32,
    pub original_size: u64,
    pub placeholder_size: u64,
    pub mimetype: String,
}

/// Response of the stats endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub pool: crate::pool::PoolStats,
    pub contexts: usize,
    pub sse_channels: usize,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Convert AcceptError to an HTTP response.
///
/// 4xx conditions are logged at WARN, 5xx at ERROR.
impl IntoResponse for AcceptError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AcceptError::InvalidParameter { .. } => (StatusCode::BAD_REQUEST, "invalid_parameter"),
            AcceptError::MissingFile(_) => (StatusCode::BAD_REQUEST, "missing_file"),
            AcceptError::UnsupportedFormat { .. } => {
                (StatusCode::BAD_REQUEST, "unsupported_format")
            }
            AcceptError::InvalidCallbacks(_) => (StatusCode::BAD_REQUEST, "invalid_callbacks"),
            AcceptError::TooManyFiles { .. } => (StatusCode::BAD_REQUEST, "too_many_files"),
            AcceptError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "file_too_large"),
            AcceptError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AcceptError::DuplicateId(_) => (StatusCode::CONFLICT, "duplicate_id"),
            AcceptError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
            AcceptError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            AcceptError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let message = self.to_string();
        if status.is_server_error() {
            error!(error = %message, "request failed");
        } else {
            warn!(error = %message, "request rejected");
        }

        let body = ErrorResponse::with_status(error_type, message, status);
        (status, Json(body)).into_response()
    }
}

fn multipart_error(e: MultipartError) -> AcceptError {
    AcceptError::InvalidParameter {
        name: "multipart",
        message: e.to_string(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /image-optimization/optimize`
pub async fn optimize_handler(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQueryParams>,
    mut multipart: Multipart,
) -> Result<Json<OptimizeResponse>, AcceptError> {
    let options = build_options(&state, &query)?;

    let mut upload = None;
    let mut callbacks = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                upload = Some(
                    save_upload(field, &state.limits.temp_dir, state.limits.max_file_size).await?,
                );
            }
            "callbacks" => {
                let text = field.text().await.map_err(multipart_error)?;
                callbacks = parse_callbacks(&text)?;
            }
            other => debug!(field = %other, "ignoring unknown multipart field"),
        }
    }
    let upload = upload.ok_or(AcceptError::MissingFile("image"))?;

    let accepted = state
        .service
        .accept_single(upload, callbacks, options)
        .await?;

    Ok(Json(OptimizeResponse {
        message: "Image accepted for optimization".to_string(),
        original_size: accepted.original_size,
        data: accepted.new_file_path,
        download_url: accepted.download_url,
        callbacks_scheduled: accepted.callbacks_scheduled,
        optimization_id: accepted.optimization_id,
    }))
}

/// `POST /image-optimization/batch-optimize`
pub async fn batch_optimize_handler(
    State(state): State<AppState>,
    Query(query): Query<OptimizeQueryParams>,
    mut multipart: Multipart,
) -> Result<Json<BatchOptimizeResponse>, AcceptError> {
    let options = build_options(&state, &query)?;

    let mut uploads = Vec::new();
    let mut callbacks = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                if uploads.len() >= state.limits.max_batch_files {
                    return Err(AcceptError::TooManyFiles {
                        count: uploads.len() + 1,
                        max: state.limits.max_batch_files,
                    });
                }
                uploads.push(
                    save_upload(field, &state.limits.temp_dir, state.limits.batch_file_size)
                        .await?,
                );
            }
            "callbacks" => {
                let text = field.text().await.map_err(multipart_error)?;
                callbacks = parse_callbacks(&text)?;
            }
            other => debug!(field = %other, "ignoring unknown multipart field"),
        }
    }
    if uploads.is_empty() {
        return Err(AcceptError::MissingFile("files"));
    }

    let accepted = state
        .service
        .accept_batch(uploads, callbacks, options)
        .await?;

    Ok(Json(BatchOptimizeResponse {
        message: format!("{} images accepted for optimization", accepted.items.len()),
        count: accepted.items.len(),
        callbacks_scheduled: accepted.callbacks_scheduled,
        optimization_id: accepted.optimization_id,
        results: accepted
            .items
            .into_iter()
            .map(|item| BatchResponseItem {
                original_name: item.original_name,
                data: item.new_file_path,
                download_url: item.download_url,
                original_size: item.original_size,
            })
            .collect(),
    }))
}

/// `POST /image-optimization/blur-placeholder`
pub async fn blur_placeholder_handler(
    State(state): State<AppState>,
    Query(query): Query<PlaceholderQueryParams>,
    mut multipart: Multipart,
) -> Result<Json<PlaceholderResponse>, AcceptError> {
    let options = validate_placeholder_params(&query)?;

    let mut source: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name().unwrap_or_default() == "image" {
            source = Some(read_field_bytes(field, state.limits.max_file_size).await?);
        }
    }
    let source = source.ok_or(AcceptError::MissingFile("image"))?;
    let original_size = source.len() as u64;

    let placeholder = state
        .service
        .blur_placeholder(source, options)
        .await
        .map_err(|e| match e {
            TransformError::Decode(message) => AcceptError::InvalidParameter {
                name: "image",
                message,
            },
            other => AcceptError::Internal(other.to_string()),
        })?;

    Ok(Json(PlaceholderResponse {
        message: "Blur placeholder generated".to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(&placeholder.bytes),
        width: placeholder.width,
        height: placeholder.height,
        original_size,
        placeholder_size: placeholder.bytes.len() as u64,
        mimetype: "image/jpeg".to_string(),
    }))
}

/// `GET /image-optimization/download/{filename}` (legacy local serve)
pub async fn download_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AcceptError> {
    static FILENAME_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = FILENAME_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z]{2,4}$").expect("valid pattern"));

    if !pattern.is_match(&filename) {
        return Err(AcceptError::InvalidParameter {
            name: "filename",
            message: "filename contains unsupported characters".to_string(),
        });
    }

    let path = state.limits.download_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AcceptError::NotFound(filename.clone()))?;

    let content_type = content_type_for(&filename);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// `GET /image-optimization/stats`
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pool: state.service.pool().stats(),
        contexts: state.service.registry().count().await,
        sse_channels: state.broker.channel_count().await,
    })
}

// =============================================================================
// Upload Helpers
// =============================================================================

fn build_options(
    state: &AppState,
    query: &OptimizeQueryParams,
) -> Result<OptimizeOptions, AcceptError> {
    let format = parse_output_format(query.format.as_deref().unwrap_or("jpeg"))?;
    Ok(OptimizeOptions {
        width: Some(query.width.unwrap_or(DEFAULT_OPTIMIZE_WIDTH)),
        height: query.height,
        quality: query.quality.unwrap_or(state.limits.default_quality),
        format,
        blur_radius: None,
        mobile_optimized: None,
    })
}

fn validate_placeholder_params(
    query: &PlaceholderQueryParams,
) -> Result<PlaceholderOptions, AcceptError> {
    if let Some(width) = query.width {
        if !(10..=256).contains(&width) {
            return Err(AcceptError::InvalidParameter {
                name: "width",
                message: format!("must be between 10 and 256, got {}", width),
            });
        }
    }
    if let Some(radius) = query.blur_radius {
        if !(1..=50).contains(&radius) {
            return Err(AcceptError::InvalidParameter {
                name: "blurRadius",
                message: format!("must be between 1 and 50, got {}", radius),
            });
        }
    }
    if let Some(quality) = query.quality {
        if !(1..=50).contains(&quality) {
            return Err(AcceptError::InvalidParameter {
                name: "quality",
                message: format!("must be between 1 and 50, got {}", quality),
            });
        }
    }

    Ok(PlaceholderOptions {
        width: query.width,
        height: query.height,
        blur_radius: query.blur_radius,
        quality: query.quality,
        mobile_optimized: query.mobile_optimized,
    })
}

/// Stream a multipart field to a uuid-prefixed temp file, enforcing the
/// byte limit as chunks arrive.
async fn save_upload(
    mut field: Field<'_>,
    temp_dir: &std::path::Path,
    limit: u64,
) -> Result<StoredUpload, AcceptError> {
    let original_name = field
        .file_name()
        .map(sanitize_filename)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "upload".to_string());

    let path = temp_dir.join(format!("{}_{}", Uuid::new_v4(), original_name));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| AcceptError::Internal(format!("cannot create temp file: {}", e)))?;

    let mut size = 0u64;
    loop {
        let chunk = match field.chunk().await.map_err(multipart_error) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                discard_temp(&path).await;
                return Err(e);
            }
        };
        size += chunk.len() as u64;
        if size > limit {
            discard_temp(&path).await;
            return Err(AcceptError::FileTooLarge {
                name: original_name,
                size,
                limit,
            });
        }
        if let Err(e) = file.write_all(&chunk).await {
            discard_temp(&path).await;
            return Err(AcceptError::Internal(format!("cannot write upload: {}", e)));
        }
    }
    if let Err(e) = file.flush().await {
        discard_temp(&path).await;
        return Err(AcceptError::Internal(format!("cannot flush upload: {}", e)));
    }

    Ok(StoredUpload {
        path,
        original_name,
        size,
    })
}

/// Read a multipart field fully into memory, enforcing the byte limit.
async fn read_field_bytes(mut field: Field<'_>, limit: u64) -> Result<Bytes, AcceptError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(AcceptError::FileTooLarge {
                name: field
                    .file_name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "image".to_string()),
                size: (buffer.len() + chunk.len()) as u64,
                limit,
            });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

async fn discard_temp(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to discard temp file");
        }
    }
}

/// Keep only filesystem-safe characters from a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "webp" => "image/webp",
            "avif" => "image/avif",
            "gif" => "image/gif",
            "tif" | "tiff" => "image/tiff",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

// =============================================================================
// Tests
// =============================================================================
