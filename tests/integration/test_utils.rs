//! Shared helpers for integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use axum::{body::Body, Json, Router};
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;

use imgopt::error::UploadError;
use imgopt::pool::{PoolConfig, WorkerPool};
use imgopt::server::{create_router, AppState, RouterConfig, SurfaceLimits};
use imgopt::service::{OptimizationService, ServiceConfig};
use imgopt::storage::BlobSink;
use imgopt::store::{ContextRegistry, CONTROLLER_PARAMS};
use imgopt::{CallbackNotifier, SseBroker};

/// Download URL base used by the test app.
pub const TEST_DOWNLOAD_BASE: &str = "https://cdn.test";

// =============================================================================
// In-memory blob sink
// =============================================================================

/// Records every put; the test double for object storage.
///
/// An optional gate blocks puts until the test releases permits, letting
/// tests attach SSE subscribers before the pipeline reaches its terminal
/// event.
pub struct MemoryBlobSink {
    puts: Mutex<Vec<BlobPut>>,
    gate: Option<tokio::sync::Semaphore>,
    fail: bool,
}

#[derive(Debug, Clone)]
pub struct BlobPut {
    pub key: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl MemoryBlobSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            gate: None,
            fail: false,
        })
    }

    /// A sink that holds every put until [`MemoryBlobSink::release`].
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            gate: Some(tokio::sync::Semaphore::new(0)),
            fail: false,
        })
    }

    /// A gated sink whose puts fail once released.
    pub fn gated_failing() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            gate: Some(tokio::sync::Semaphore::new(0)),
            fail: true,
        })
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn puts(&self) -> Vec<BlobPut> {
        self.puts.lock().unwrap().clone()
    }

    /// Poll until `count` uploads arrived or the timeout elapses.
    pub async fn wait_for_puts(&self, count: usize, timeout: Duration) -> Vec<BlobPut> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let puts = self.puts();
            if puts.len() >= count {
                return puts;
            }
            if tokio::time::Instant::now() >= deadline {
                return puts;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str) -> Result<(), UploadError> {
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(UploadError::Connection("gate closed".to_string())),
            }
        }
        if self.fail {
            return Err(UploadError::Connection("sink offline".to_string()));
        }
        self.puts.lock().unwrap().push(BlobPut {
            key: key.to_string(),
            content_type: content_type.to_string(),
            bytes,
        });
        Ok(())
    }
}

// =============================================================================
// Application assembly
// =============================================================================

pub struct TestApp {
    pub router: Router,
    pub service: Arc<OptimizationService>,
    pub broker: Arc<SseBroker>,
    pub sink: Arc<MemoryBlobSink>,
    pub limits: SurfaceLimits,
    // Keeps the upload directory alive for the duration of the test.
    pub temp_dir: tempfile::TempDir,
}

/// Build a full application over an in-memory sink.
pub fn build_test_app() -> TestApp {
    build_test_app_with(MemoryBlobSink::new(), default_pool_config())
}

/// Same as [`build_test_app`] but with an explicit pool queue ceiling,
/// letting tests exercise backpressure.
pub fn build_test_app_with_ceiling(queue_ceiling: usize) -> TestApp {
    let mut config = default_pool_config();
    config.queue_ceiling = queue_ceiling;
    build_test_app_with(MemoryBlobSink::new(), config)
}

pub fn default_pool_config() -> PoolConfig {
    PoolConfig {
        min_threads: 1,
        max_threads: 2,
        idle_timeout: Duration::from_millis(200),
        queue_ceiling: 64,
    }
}

/// Build a full application over the given sink and pool configuration.
pub fn build_test_app_with(sink: Arc<MemoryBlobSink>, pool_config: PoolConfig) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("temp dir");

    let registry = Arc::new(ContextRegistry::new(
        CONTROLLER_PARAMS,
        Duration::from_secs(60),
    ));
    let pool = Arc::new(WorkerPool::new(pool_config));
    let broker = Arc::new(SseBroker::with_timings(
        Duration::from_millis(100),
        Duration::from_secs(60),
    ));
    let service = Arc::new(OptimizationService::new(
        registry,
        pool,
        Arc::clone(&broker),
        CallbackNotifier::new(),
        sink.clone() as Arc<dyn BlobSink>,
        ServiceConfig {
            download_base: TEST_DOWNLOAD_BASE.to_string(),
            context_ttl: Duration::from_secs(60),
            upload_attempts: 2,
        },
    ));

    let mut limits = SurfaceLimits::new(temp_dir.path().to_path_buf());
    limits.max_file_size = 5 * 1024 * 1024;
    limits.batch_file_size = 1024 * 1024;

    let state = AppState::new(
        Arc::clone(&service),
        Arc::clone(&broker),
        limits.clone(),
    );
    let router = create_router(state, RouterConfig::new().with_tracing(false));

    TestApp {
        router,
        service,
        broker,
        sink,
        limits,
        temp_dir,
    }
}

// =============================================================================
// Image fixtures
// =============================================================================

/// A PNG gradient of the given size.
pub fn test_png(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, Rgb, RgbImage};
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    }));
    let mut cursor = std::io::Cursor::new(Vec::new());
    img.write_to(&mut cursor, image::ImageFormat::Png)
        .expect("encode fixture png");
    cursor.into_inner()
}

/// A JPEG gradient of the given size.
pub fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, Rgb, RgbImage};
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, ((x + y) % 256) as u8, (y % 256) as u8])
    }));
    let mut cursor = std::io::Cursor::new(Vec::new());
    img.write_to(&mut cursor, image::ImageFormat::Jpeg)
        .expect("encode fixture jpeg");
    cursor.into_inner()
}

// =============================================================================
// Multipart helpers
// =============================================================================

pub const BOUNDARY: &str = "imgopt-test-boundary";

pub struct Part {
    pub name: &'static str,
    pub filename: Option<&'static str>,
    pub content_type: Option<&'static str>,
    pub data: Vec<u8>,
}

impl Part {
    pub fn file(name: &'static str, filename: &'static str, data: Vec<u8>) -> Self {
        Self {
            name,
            filename: Some(filename),
            content_type: Some("application/octet-stream"),
            data,
        }
    }

    pub fn text(name: &'static str, data: impl Into<String>) -> Self {
        Self {
            name,
            filename: None,
            content_type: None,
            data: data.into().into_bytes(),
        }
    }
}

/// Assemble a multipart/form-data body.
pub fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes(),
            ),
        }
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// POST a multipart request through the router and return the response.
pub async fn post_multipart(
    router: &Router,
    uri: &str,
    parts: &[Part],
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .expect("request");

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// GET a path through the router.
pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request");

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// =============================================================================
// Webhook capture server
// =============================================================================

/// Spin up a local HTTP server that records every JSON payload it receives.
/// Returns the hook URL and the captured payloads.
pub async fn spawn_webhook_server() -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let captured: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));

    async fn hook(
        State(captured): State<Arc<Mutex<Vec<serde_json::Value>>>>,
        Json(payload): Json<serde_json::Value>,
    ) -> StatusCode {
        captured.lock().unwrap().push(payload);
        StatusCode::OK
    }

    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(Arc::clone(&captured));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind webhook server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}/hook", addr), captured)
}

/// Poll until `count` webhook payloads arrived or the timeout elapses.
pub async fn wait_for_webhooks(
    captured: &Arc<Mutex<Vec<serde_json::Value>>>,
    count: usize,
    timeout: Duration,
) -> Vec<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let seen = captured.lock().unwrap().clone();
        if seen.len() >= count || tokio::time::Instant::now() >= deadline {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
