//! HTTP-level tests of the optimization API.

use std::time::Duration;

use axum::http::StatusCode;
use base64::Engine;
use regex::Regex;

use super::test_utils::{
    build_test_app, build_test_app_with_ceiling, get_json, post_multipart, test_jpeg, test_png,
    Part, TEST_DOWNLOAD_BASE,
};

fn minted_path_pattern() -> Regex {
    Regex::new(r"^optimized/\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}-\d{3}_.+_[0-9a-f-]{36}\.jpeg$")
        .unwrap()
}

#[tokio::test]
async fn test_optimize_accepts_and_uploads() {
    let app = build_test_app();
    let source = test_jpeg(1920, 1080);
    let original_len = source.len() as u64;

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=800&quality=80&format=jpeg",
        &[Part::file("image", "photo.jpg", source)],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_str().expect("data");
    assert!(
        minted_path_pattern().is_match(data),
        "unexpected minted path: {}",
        data
    );
    assert_eq!(body["callbacksScheduled"], 0);
    assert_eq!(body["originalSize"], original_len);
    assert_eq!(
        body["downloadUrl"].as_str().unwrap(),
        format!("{}/{}", TEST_DOWNLOAD_BASE, data)
    );
    assert!(body["optimizationId"].as_str().is_some());

    // The asynchronous arm uploads exactly once, under the minted key,
    // with the jpeg content type and a width within the requested bound.
    let puts = app.sink.wait_for_puts(1, Duration::from_secs(10)).await;
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].key, data);
    assert_eq!(puts[0].content_type, "image/jpeg");

    let optimized = image::load_from_memory(&puts[0].bytes).expect("decode uploaded artifact");
    assert!(optimized.width() <= 800);
}

#[tokio::test]
async fn test_optimize_rejects_unsupported_format() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?format=bmp",
        &[Part::file("image", "photo.png", test_png(32, 32))],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["message"].as_str().unwrap_or_default();
    assert!(message.contains("bmp"));
    // The body enumerates the supported output formats.
    for format in ["jpeg", "png", "webp", "avif", "gif", "tiff", "auto"] {
        assert!(message.contains(format), "missing {} in: {}", format, message);
    }

    // The blob sink is never touched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app.sink.puts().is_empty());
}

#[tokio::test]
async fn test_optimize_rejects_out_of_range_params() {
    let app = build_test_app();
    let png = test_png(16, 16);

    let (status, _) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=0",
        &[Part::file("image", "a.png", png.clone())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=9000",
        &[Part::file("image", "a.png", png.clone())],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_multipart(
        &app.router,
        "/image-optimization/optimize?quality=101",
        &[Part::file("image", "a.png", png)],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_optimize_requires_image_field() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[Part::text("callbacks", "[]")],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_file");
}

#[tokio::test]
async fn test_optimize_undecodable_upload_still_accepted() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[Part::file("image", "junk.jpg", b"not an image at all".to_vec())],
    )
    .await;

    // The accept succeeds; the failure surfaces asynchronously.
    assert_eq!(status, StatusCode::OK);
    assert!(body["optimizationId"].as_str().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(app.sink.puts().is_empty());
}

#[tokio::test]
async fn test_optimize_bare_object_callbacks_scheduled() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[
            Part::file("image", "a.png", test_png(32, 32)),
            // A bare object, not an array: the parser repairs it.
            Part::text("callbacks", r#"{"url":"http://127.0.0.1:9/hook"}"#),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["callbacksScheduled"], 1);
}

#[tokio::test]
async fn test_optimize_unparseable_callbacks_rejected() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[
            Part::file("image", "a.png", test_png(16, 16)),
            Part::text("callbacks", "definitely not json"),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_callbacks");
}

#[tokio::test]
async fn test_batch_optimize_preserves_order() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/batch-optimize?format=webp&width=64",
        &[
            Part::file("files", "first.png", test_png(100, 100)),
            Part::file("files", "second.png", test_png(90, 60)),
            Part::file("files", "third.png", test_png(60, 90)),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    let results = body["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["originalName"], "first.png");
    assert_eq!(results[1]["originalName"], "second.png");
    assert_eq!(results[2]["originalName"], "third.png");

    // Each successful file is uploaded under "{id}_{index}".
    let id = body["optimizationId"].as_str().unwrap();
    let puts = app.sink.wait_for_puts(3, Duration::from_secs(10)).await;
    let mut keys: Vec<String> = puts.iter().map(|p| p.key.clone()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![format!("{}_0", id), format!("{}_1", id), format!("{}_2", id)]
    );
    assert!(puts.iter().all(|p| p.content_type == "image/webp"));
}

#[tokio::test]
async fn test_batch_optimize_requires_files() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/batch-optimize",
        &[Part::text("callbacks", "[]")],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_file");
}

#[tokio::test]
async fn test_accept_backpressure_returns_503() {
    // Queue ceiling of zero: every accept trips the saturation check.
    let app = build_test_app_with_ceiling(0);

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[Part::file("image", "a.png", test_png(16, 16))],
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "busy");
}

#[tokio::test]
async fn test_blur_placeholder_mobile_bounds() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/blur-placeholder",
        &[Part::file("image", "a.png", test_png(800, 600))],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let width = body["width"].as_u64().unwrap();
    assert!((20..=40).contains(&width), "width out of range: {}", width);
    assert_eq!(body["mimetype"], "image/jpeg");

    // data is valid base64 of a jpeg.
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body["data"].as_str().unwrap())
        .expect("base64");
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(body["placeholderSize"], bytes.len() as u64);
}

#[tokio::test]
async fn test_blur_placeholder_validates_ranges() {
    let app = build_test_app();
    let png = test_png(64, 64);

    for uri in [
        "/image-optimization/blur-placeholder?width=5",
        "/image-optimization/blur-placeholder?width=500",
        "/image-optimization/blur-placeholder?blurRadius=60",
        "/image-optimization/blur-placeholder?quality=80",
    ] {
        let (status, _) =
            post_multipart(&app.router, uri, &[Part::file("image", "a.png", png.clone())]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "expected 400 for {}", uri);
    }
}

#[tokio::test]
async fn test_download_validates_filename() {
    let app = build_test_app();

    let (status, _) = get_json(
        &app.router,
        "/image-optimization/download/..%2Fsecret.txt",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&app.router, "/image-optimization/download/no-extension").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&app.router, "/image-optimization/download/missing.jpeg").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_serves_local_artifact() {
    let app = build_test_app();
    let artifact = test_jpeg(20, 20);

    std::fs::create_dir_all(&app.limits.download_dir).unwrap();
    std::fs::write(app.limits.download_dir.join("artifact.jpeg"), &artifact).unwrap();

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/image-optimization/download/artifact.jpeg")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.router.clone(), request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap(),
        "image/jpeg"
    );
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_app();
    let (status, body) = get_json(&app.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn test_stats_endpoint() {
    let app = build_test_app();
    let (status, body) = get_json(&app.router, "/image-optimization/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["maxThreads"], 2);
    assert!(body["contexts"].as_u64().is_some());
    assert!(body["sseChannels"].as_u64().is_some());
}
