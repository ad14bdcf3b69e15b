//! HTTP API integration tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use bookmill_common::config::ValueDomains;
use bookmill_common::db::BookRegistry;
use bookmill_common::events::EventBus;
use bookmill_pipeline::jobs::{ExecutorRegistry, JobQueue};
use bookmill_pipeline::services::hash_bytes;
use bookmill_pipeline::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

/// Test helper: router over a temp root folder with a `noop` and a `hang` job type
fn create_test_app() -> (Router, TempDir) {
    let root = tempfile::tempdir().expect("Failed to create temp dir");
    let books = Arc::new(BookRegistry::new(root.path()));

    let mut executors = ExecutorRegistry::new();
    executors.register("noop", |_job, _updater| async { Ok(None) });
    executors.register("hang", |_job, _updater| async {
        futures::future::pending::<()>().await;
        Ok(None)
    });
    let queue = JobQueue::new(executors, EventBus::default());

    let state = AppState::new(books, queue, ValueDomains::default(), 2000);
    (build_router(state), root)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _root) = create_test_app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "bookmill");
}

#[tokio::test]
async fn test_unknown_book_is_404() {
    let (app, _root) = create_test_app();
    let (status, body) = send(
        &app,
        "GET",
        "/books/missing/artifacts/text-classification/pg001/versions",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_versions_read_and_edit_flow() {
    let (app, _root) = create_test_app();
    assert_eq!(send(&app, "POST", "/books/novel", None).await.0, StatusCode::CREATED);

    let base = "/books/novel/artifacts/text-classification/pg001";
    let (status, body) = send(
        &app,
        "POST",
        &format!("{}/versions", base),
        Some(json!({"data": {"groups": [{"group_type": "paragraph", "texts": ["Call me"]}]}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["version"], 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("{}/edits", base),
        Some(json!({"path": ["groups", 0, "group_type"], "value": "heading"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({"base_version": 1, "version": 2}));

    let (status, body) = send(&app, "GET", &format!("{}/versions", base), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["versions"], json!([1, 2]));
    assert!(body.get("current").is_none());

    let (_, latest) = send(&app, "GET", base, None).await;
    assert_eq!(latest["version"], 2);
    assert_eq!(latest["data"]["groups"][0]["group_type"], "heading");

    let (_, first) = send(&app, "GET", &format!("{}?version=1", base), None).await;
    assert_eq!(first["data"]["groups"][0]["group_type"], "paragraph");

    let (status, _) = send(&app, "GET", &format!("{}?version=9", base), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_edit_validation_errors_are_400() {
    let (app, _root) = create_test_app();
    send(&app, "POST", "/books/novel", None).await;
    let base = "/books/novel/artifacts/text-classification/pg001";
    send(&app, "POST", &format!("{}/versions", base), Some(json!({"data": {"groups": []}}))).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("{}/edits", base),
        Some(json!({"path": ["groups", 4, "group_type"], "value": "heading"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = send(&app, "GET", "/books/novel/artifacts/bogus-kind/pg001", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_set_current_and_page_composite() {
    let (app, _root) = create_test_app();
    send(&app, "POST", "/books/novel", None).await;

    let item = "/books/novel/artifacts/rendering/pg001_s001";
    send(&app, "POST", &format!("{}/versions", item), Some(json!({"data": {"html": "a"}}))).await;
    send(&app, "POST", &format!("{}/versions", item), Some(json!({"data": {"html": "b"}}))).await;

    let (status, _) = send(&app, "PUT", &format!("{}/current", item), Some(json!({"version": 1}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "PUT", &format!("{}/current", item), Some(json!({"version": 7}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listing) = send(&app, "GET", &format!("{}/versions", item), None).await;
    assert_eq!(listing["current"], 1);

    let (status, page) = send(&app, "GET", "/books/novel/pages/pg001/rendering", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"][0]["version"], 1);
    assert_eq!(page["items"][0]["data"]["html"], "a");

    let (status, _) = send(&app, "GET", "/books/novel/pages/pg002/rendering", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_page_of_tombstones_is_empty_not_404() {
    let (app, _root) = create_test_app();
    send(&app, "POST", "/books/novel", None).await;
    send(
        &app,
        "POST",
        "/books/novel/artifacts/sectioning/pg001_s001/versions",
        Some(json!({"data": null})),
    )
    .await;

    let (status, page) = send(&app, "GET", "/books/novel/pages/pg001/sectioning", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"], json!([]));
}

#[tokio::test]
async fn test_jobs_and_delete_cancels() {
    let (app, _root) = create_test_app();
    send(&app, "POST", "/books/novel", None).await;

    let (status, body) = send(&app, "POST", "/books/novel/jobs", Some(json!({"type": "hang"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, job) = send(&app, "GET", &format!("/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "running");
    assert_eq!(job["type"], "hang");

    let (status, _) = send(&app, "POST", "/books/novel/jobs", Some(json!({"type": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "DELETE", "/books/novel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], 1);

    let (_, job) = send(&app, "GET", &format!("/jobs/{}", job_id), None).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"], "Book deleted");

    // Deleted until re-enabled
    let (status, body) = send(&app, "POST", "/books/novel/jobs", Some(json!({"type": "noop"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "BOOK_DELETED");
    let (status, _) = send(&app, "POST", "/books/novel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, "POST", "/books/novel/reenable", None).await;
    assert_eq!(body["reenabled"], true);
    assert_eq!(send(&app, "POST", "/books/novel", None).await.0, StatusCode::CREATED);

    let (_, jobs) = send(&app, "GET", "/books/novel/jobs", None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let (app, _root) = create_test_app();
    let (status, _) = send(&app, "GET", &format!("/jobs/{}", uuid::Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_image_upload_and_lookup() {
    let (app, _root) = create_test_app();
    send(&app, "POST", "/books/novel", None).await;

    let bytes = b"\x89PNG fake raster";
    let (status, body) = send(
        &app,
        "POST",
        "/books/novel/images",
        Some(json!({
            "file_name": "pg001.png",
            "data": format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(bytes)),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let hash = hash_bytes(bytes);
    assert_eq!(body["hash"], hash.as_str());

    let request = Request::builder()
        .uri(format!("/books/novel/images/{}?page=pg001", hash))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    let served = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&served[..], bytes);

    let (status, _) = send(&app, "GET", &format!("/books/novel/images/{}", hash_bytes(b"other")), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
