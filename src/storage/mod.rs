//! Blob sink abstraction and its S3 implementation.
//!
//! Optimized artifacts are uploaded to object storage under the minted
//! destination key. The sink is a trait so the orchestrator (and the tests)
//! never depend on a concrete backend.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::error::UploadError;

// =============================================================================
// BlobSink Trait
// =============================================================================

/// Destination for optimized artifacts.
///
/// The key is used verbatim; content type travels with the object so CDNs
/// can serve it directly.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Upload `bytes` under `key` with the given content type.
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str) -> Result<(), UploadError>;
}

// =============================================================================
// S3 Blob Sink
// =============================================================================

/// S3-backed implementation of [`BlobSink`].
///
/// Works against AWS S3 or any S3-compatible service (MinIO, etc.) via a
/// custom endpoint on the client.
#[derive(Clone)]
pub struct S3BlobSink {
    client: Client,
    bucket: String,
}

impl S3BlobSink {
    /// Create a sink targeting the given bucket.
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobSink for S3BlobSink {
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("NoSuchBucket") {
                    UploadError::BucketNotFound(self.bucket.clone())
                } else if e.as_service_error().is_some() {
                    UploadError::S3(message)
                } else {
                    UploadError::Connection(message)
                }
            })?;
        Ok(())
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
///
/// For AWS S3, pass `None` to use the default endpoint.
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services usually require path-style addressing.
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}

// =============================================================================
// Tests
// =============================================================================
