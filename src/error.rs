use thiserror::Error;

/// Errors produced by the image transformer.
///
/// The transformer is a pure bytes-in/bytes-out component, so every failure
/// is either a decode problem (bad input) or an encode problem (codec
/// rejected the request).
#[derive(Debug, Error)]
pub enum TransformError {
    /// The source bytes could not be decoded as any supported image format
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// A codec failed to encode the processed image
    #[error("failed to encode image as {format}: {message}")]
    Encode {
        format: &'static str,
        message: String,
    },

    /// Every candidate encoding failed during auto-format selection
    #[error("auto format selection failed: no candidate encoding succeeded")]
    AllCandidatesFailed,

    /// The requested output format is not supported
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    /// A dimension parameter is outside the usable range
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The watermark label could not be rendered
    #[error("failed to render watermark label: {0}")]
    Render(String),
}

/// Errors surfaced by the worker pool at submission time.
///
/// Task failures never appear here: a failing task produces an outcome with
/// `success = false`. This enum covers only rejected submissions.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is shutting down and no longer accepts work
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The waiting queue reached its ceiling
    #[error("worker queue is full: {depth} tasks waiting (ceiling {ceiling})")]
    QueueFull { depth: usize, ceiling: usize },

    /// The worker executing the task disappeared before replying
    #[error("worker dropped the task before completion")]
    WorkerLost,
}

/// Errors from the blob sink (object storage).
#[derive(Debug, Error)]
pub enum UploadError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Network or connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Target bucket does not exist or is inaccessible
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
}

/// Client-facing errors raised at accept time, before any work is queued.
///
/// These map to HTTP responses in the server layer; everything that happens
/// after accept is surfaced through SSE events and callbacks instead.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// A request parameter is outside its allowed range
    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter {
        name: &'static str,
        message: String,
    },

    /// The multipart upload did not contain the expected file field
    #[error("missing file field `{0}`")]
    MissingFile(&'static str),

    /// The requested format is not in the supported set
    #[error("unsupported format `{format}`; supported formats: {supported}")]
    UnsupportedFormat { format: String, supported: String },

    /// The callbacks form field could not be parsed, even after repair
    #[error("unparseable callbacks field: {0}")]
    InvalidCallbacks(String),

    /// Too many files in a batch upload
    #[error("too many files: {count} uploaded, maximum is {max}")]
    TooManyFiles { count: usize, max: usize },

    /// An uploaded file exceeds the size limit
    #[error("file `{name}` too large: {size} bytes, limit is {limit}")]
    FileTooLarge {
        name: String,
        size: u64,
        limit: u64,
    },

    /// The minted optimization id collides with a live context
    #[error("optimization id collision: {0}")]
    DuplicateId(String),

    /// The worker queue is saturated; the caller should retry later
    #[error("service is busy: worker queue is saturated")]
    Busy,

    /// The service is shutting down
    #[error("service is shutting down")]
    ShuttingDown,

    /// A requested artifact does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected internal failure during accept
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PoolError> for AcceptError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ShuttingDown => AcceptError::ShuttingDown,
            PoolError::QueueFull { .. } => AcceptError::Busy,
            PoolError::WorkerLost => AcceptError::Internal(e.to_string()),
        }
    }
}
