// tests/api_router.rs
//
// HTTP-level tests for the status router without opening sockets.
// The router is exercised directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /status (coordinator flags + poller board)
// - POST /batch/run (400 on a bad date, 202 then 409 while a batch runs)

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tower::ServiceExt as _; // for `oneshot`

use column_harvester::api::{self, AppState};
use column_harvester::coordinator::PipelineCoordinator;
use column_harvester::store::DataLayout;

use common::{coordinator, fast_retry, item, write_raw, RecordingNotifier, ScriptedClassifier};

const BODY_LIMIT: usize = 1024 * 1024;

fn test_router(coord: Arc<PipelineCoordinator>) -> Router {
    api::router(AppState { coordinator: coord })
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

#[tokio::test]
async fn health_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(coordinator(
        dir.path(),
        Arc::new(ScriptedClassifier::new()),
        RecordingNotifier::new(),
        fast_retry(),
    ));

    let (status, body) = send(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "ok");
}

#[tokio::test]
async fn status_reports_gate_and_board() {
    let dir = tempfile::tempdir().unwrap();
    let coord = coordinator(
        dir.path(),
        Arc::new(ScriptedClassifier::new()),
        RecordingNotifier::new(),
        fast_retry(),
    );
    coord.status().register("0", "NEAR column");
    let app = test_router(coord);

    let (status, body) = send(&app, "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&body).expect("status json");
    assert_eq!(v["scraping_enabled"], true);
    assert_eq!(v["batch_running"], false);
    assert!(v["last_batch"].is_null());
    assert_eq!(v["totals"]["total_errors"], 0);
    assert_eq!(v["sources"]["0"]["label"], "NEAR column");
    assert_eq!(v["sources"]["0"]["state"], "idle");
}

#[tokio::test]
async fn batch_run_rejects_malformed_date() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(coordinator(
        dir.path(),
        Arc::new(ScriptedClassifier::new()),
        RecordingNotifier::new(),
        fast_retry(),
    ));

    let (status, body) = send(&app, "POST", "/batch/run?date=2025-13-01").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert!(v["error"].as_str().unwrap().contains("YYYYMMDD"));
}

#[tokio::test]
async fn batch_run_accepts_then_conflicts_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_raw(
        &layout,
        "20250301",
        "0",
        &[item("n1", "NEAR intents went live this morning", "near")],
    )
    .await;

    let permits = Arc::new(Semaphore::new(0));
    let coord = coordinator(
        dir.path(),
        Arc::new(ScriptedClassifier::new().gated(permits.clone())),
        RecordingNotifier::new(),
        fast_retry(),
    );
    let app = test_router(coord.clone());

    let (status, body) = send(&app, "POST", "/batch/run?date=20250301").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "accepted");
    assert_eq!(v["date"], "20250301");

    // The first batch is parked inside the classifier.
    let (status, _) = send(&app, "POST", "/batch/run?date=20250301").await;
    assert_eq!(status, StatusCode::CONFLICT);

    permits.add_permits(100);
    tokio::time::timeout(Duration::from_secs(5), async {
        while coord.batch_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch finishes once released");

    let (_, body) = send(&app, "GET", "/status").await;
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["scraping_enabled"], true);
    assert_eq!(v["last_batch"]["date"], "20250301");
    assert_eq!(v["last_batch"]["outcome"]["status"], "completed");
}
