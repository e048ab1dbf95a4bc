//! Router-level tests of the worker HTTP surface: submission bounds,
//! capacity rejection, auth enforcement, and status/cancel codes.

use crate::api::{create_router, AppState};
use crate::engine::TaskExecutionEngine;
use crate::events::EventBus;
use crate::provider::ProcessPoolProvider;
use crate::unified::UnifiedProvider;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use shared::config::{ProcessPoolConfig, WorkerConfig};
use shared::task::ExecutionMode;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn worker_config(max_concurrent_tasks: usize) -> WorkerConfig {
    let toml = format!(
        "worker_id = \"test-worker\"\nmax_concurrent_tasks = {}\n",
        max_concurrent_tasks
    );
    toml::from_str(&toml).unwrap()
}

fn build_app(max_concurrent_tasks: usize, api_key: Option<&str>) -> axum::Router {
    let pool = ProcessPoolProvider::new(ProcessPoolConfig {
        command: "sh".to_string(),
        min: 0,
        max: 2,
        idle_silence_ms: 300,
        acquire_timeout_ms: 2_000,
        workspace_dir: std::env::temp_dir().display().to_string(),
        ..Default::default()
    });
    let provider =
        Arc::new(UnifiedProvider::new(Some(pool), None, ExecutionMode::ProcessPool, true).unwrap());
    let events = Arc::new(EventBus::new(64));
    let engine = Arc::new(TaskExecutionEngine::new(
        provider,
        Arc::clone(&events),
        max_concurrent_tasks,
        60_000,
    ));
    let state = AppState::new(
        Arc::new(worker_config(max_concurrent_tasks)),
        engine,
        events,
        api_key.map(str::to_string),
    );
    create_router(state)
}

fn run_request(body: String, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/run")
        .header("content-type", "application/json");
    if let Some(api_key) = api_key {
        builder = builder.header("X-Api-Key", api_key);
    }
    builder.body(Body::from(body)).unwrap()
}

fn prompt_json(prompt: &str) -> String {
    serde_json::json!({ "prompt": prompt }).to_string()
}

#[tokio::test]
async fn test_health_is_open_and_ok() {
    let app = build_app(2, Some("secret"));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_run_validation_bounds() {
    let app = build_app(2, None);
    let response = app
        .clone()
        .oneshot(run_request(prompt_json(""), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = serde_json::json!({ "prompt": "echo hi", "timeoutMs": 999 }).to_string();
    let response = app.clone().oneshot(run_request(body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(run_request(prompt_json("echo hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_capacity_exceeded_returns_503() {
    let app = build_app(1, None);
    // First task holds the single slot with a long-running command
    let response = app
        .clone()
        .oneshot(run_request(prompt_json("sleep 5"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(run_request(prompt_json("echo queued"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let app = build_app(2, Some("secret"));
    let response = app
        .clone()
        .oneshot(run_request(prompt_json("echo hi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(run_request(prompt_json("echo hi"), Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(run_request(prompt_json("echo hi"), Some("secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_task_status_and_stream_are_not_found() {
    let app = build_app(2, None);
    let task_id = Uuid::new_v4();
    for uri in [format!("/tasks/{}", task_id), format!("/stream/{}", task_id)] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn test_cancel_unknown_task_is_not_found() {
    let app = build_app(2, None);
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/tasks/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
