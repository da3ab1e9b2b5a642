//! End-to-end pipeline tests: SSE delivery and webhook fan-out.

use std::time::Duration;

use axum::http::StatusCode;

use imgopt::OptimizationEvent;

use imgopt::pool::PoolConfig;

use super::test_utils::{
    build_test_app, build_test_app_with, default_pool_config, post_multipart,
    spawn_webhook_server, test_png, wait_for_webhooks, MemoryBlobSink, Part,
};

async fn next_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<OptimizationEvent>,
) -> OptimizationEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream closed early");
            if event.is_terminal() {
                return event;
            }
        }
    })
    .await
    .expect("no terminal event within timeout")
}

#[tokio::test]
async fn test_subscriber_observes_complete_event() {
    // The gated sink holds the pipeline just before its terminal event, so
    // the subscriber always attaches in time.
    let sink = MemoryBlobSink::gated();
    let app = build_test_app_with(sink.clone(), default_pool_config());

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=64",
        &[Part::file("image", "a.png", test_png(256, 256))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let id = body["optimizationId"].as_str().unwrap();
    let mut rx = app.broker.subscribe(id).await.unwrap();
    sink.release(1);

    let event = next_terminal(&mut rx).await;
    let OptimizationEvent::Complete { payload, .. } = event else {
        panic!("expected complete event");
    };
    assert_eq!(payload["status"], "success");
    assert_eq!(payload["data"], body["data"]);
    assert_eq!(payload["downloadUrl"], body["downloadUrl"]);
}

#[tokio::test]
async fn test_subscriber_observes_upload_failure_as_error() {
    let sink = MemoryBlobSink::gated_failing();
    let app = build_test_app_with(sink.clone(), default_pool_config());

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=64",
        &[Part::file("image", "a.png", test_png(64, 64))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let id = body["optimizationId"].as_str().unwrap();
    let mut rx = app.broker.subscribe(id).await.unwrap();
    // Both upload attempts fail once released.
    sink.release(2);

    let event = next_terminal(&mut rx).await;
    assert!(matches!(event, OptimizationEvent::Error { .. }));
}

#[tokio::test]
async fn test_subscriber_observes_decode_failure_as_error() {
    // A single worker pinned by a slow avif encode keeps the junk upload
    // queued until the subscriber is attached.
    let app = build_test_app_with(
        MemoryBlobSink::gated(),
        PoolConfig {
            min_threads: 1,
            max_threads: 1,
            idle_timeout: Duration::from_millis(200),
            queue_ceiling: 8,
        },
    );

    let (status, _) = post_multipart(
        &app.router,
        "/image-optimization/optimize?format=avif&quality=90",
        &[Part::file("image", "slow.png", test_png(1200, 1200))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Give the first pipeline time to occupy the only worker.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[Part::file("image", "junk.png", b"garbage bytes".to_vec())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let id = body["optimizationId"].as_str().unwrap();
    let mut rx = app.broker.subscribe(id).await.unwrap();

    let event = next_terminal(&mut rx).await;
    assert!(matches!(event, OptimizationEvent::Error { .. }));
}

#[tokio::test]
async fn test_single_callback_fires_on_success() {
    let app = build_test_app();
    let (hook_url, captured) = spawn_webhook_server().await;

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=64",
        &[
            Part::file("image", "a.png", test_png(128, 128)),
            // A bare object: repaired into a one-element array, so exactly
            // one webhook fires on completion.
            Part::text("callbacks", format!(r#"{{"url":"{}"}}"#, hook_url)),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["callbacksScheduled"], 1);

    let payloads = wait_for_webhooks(&captured, 1, Duration::from_secs(10)).await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["status"], "success");
    assert_eq!(payloads[0]["optimizationId"], body["optimizationId"]);
    assert_eq!(payloads[0]["data"], body["data"]);
}

#[tokio::test]
async fn test_callback_reports_error_status() {
    let app = build_test_app();
    let (hook_url, captured) = spawn_webhook_server().await;

    let (status, _) = post_multipart(
        &app.router,
        "/image-optimization/optimize",
        &[
            Part::file("image", "junk.png", b"not an image".to_vec()),
            Part::text(
                "callbacks",
                format!(r#"[{{"url":"{}"}}]"#, hook_url),
            ),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let payloads = wait_for_webhooks(&captured, 1, Duration::from_secs(10)).await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["status"], "error");
    assert!(payloads[0]["error"].as_str().is_some());
}

#[tokio::test]
async fn test_batch_fires_one_consolidated_callback() {
    let app = build_test_app();
    let (hook_url, captured) = spawn_webhook_server().await;

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/batch-optimize?width=48",
        &[
            Part::file("files", "a.png", test_png(64, 64)),
            Part::file("files", "b.png", test_png(72, 48)),
            Part::file("files", "c.png", test_png(48, 72)),
            Part::text(
                "callbacks",
                format!(r#"[{{"url":"{}"}}]"#, hook_url),
            ),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);

    let payloads = wait_for_webhooks(&captured, 1, Duration::from_secs(15)).await;
    assert_eq!(payloads.len(), 1, "expected exactly one consolidated callback");
    assert_eq!(payloads[0]["totalFiles"], 3);
    assert_eq!(payloads[0]["successfulFiles"], 3);
    assert_eq!(payloads[0]["failedFiles"], 0);

    let results = payloads[0]["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["originalName"], "a.png");
    assert_eq!(results[1]["originalName"], "b.png");
    assert_eq!(results[2]["originalName"], "c.png");

    // No second callback shows up afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_context_registered_at_accept() {
    let app = build_test_app();

    let (status, body) = post_multipart(
        &app.router,
        "/image-optimization/optimize?width=64",
        &[Part::file("image", "a.png", test_png(64, 64))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let id = body["optimizationId"].as_str().unwrap();
    let stored = app.service.registry().get(id).await.expect("context stored");
    assert_eq!(
        stored.value.new_file_path.as_deref(),
        body["data"].as_str()
    );
    assert_eq!(stored.client_id, id);
}
