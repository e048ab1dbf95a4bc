//! Minimal in-process worker used by coordinator tests.
//!
//! Serves just enough of the worker surface: a health endpoint, a run
//! endpoint that always accepts, a status endpoint that reports completion,
//! and an SSE stream that plays a fixed frame script and closes.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    RunTaskRequest, RunTaskResponse, TaskStatusResponse, WorkerHealthResponse, WorkerStatus,
};
use shared::task::{ExecutionMode, TaskStatus};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct StubState {
    /// Number of times the stream endpoint was opened
    pub stream_opens: Arc<AtomicUsize>,
    /// Number of run submissions received
    pub runs: Arc<AtomicUsize>,
}

impl StubState {
    fn new() -> Self {
        StubState {
            stream_opens: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

async fn health() -> Json<WorkerHealthResponse> {
    Json(WorkerHealthResponse {
        status: WorkerStatus::Available,
        worker_id: "stub-worker".to_string(),
        name: "stub-worker".to_string(),
        version: "0.0.0".to_string(),
        active_tasks: 0,
        max_tasks: 5,
        total_tasks_executed: 0,
        uptime_ms: 1000,
        capabilities: vec!["code".to_string()],
        execution_mode: ExecutionMode::ProcessPool,
    })
}

async fn run(
    State(state): State<StubState>,
    Json(request): Json<RunTaskRequest>,
) -> Json<RunTaskResponse> {
    state.runs.fetch_add(1, Ordering::SeqCst);
    let task_id = request.task_id.unwrap_or_else(Uuid::new_v4);
    Json(RunTaskResponse {
        task_id,
        status: TaskStatus::Assigned,
        estimated_duration_ms: Some(1200),
        stream_url: Some(format!("/stream/{}", task_id)),
    })
}

async fn task_status(Path(id): Path<Uuid>) -> Json<TaskStatusResponse> {
    Json(TaskStatusResponse {
        task_id: id,
        status: TaskStatus::Completed,
        assigned_worker: None,
        created_at: chrono::Utc::now(),
        started_at: Some(chrono::Utc::now()),
        completed_at: Some(chrono::Utc::now()),
        output: Some("stub output".to_string()),
        error: None,
        progress: Some(100),
        duration_ms: Some(7),
    })
}

async fn stream(
    State(state): State<StubState>,
    Path(id): Path<Uuid>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    use futures_util::StreamExt;

    state.stream_opens.fetch_add(1, Ordering::SeqCst);
    let frames = vec![
        Ok(Event::default()
            .event("status")
            .data(format!(r#"{{"taskId":"{id}","status":"running"}}"#))),
        Ok(Event::default()
            .event("progress")
            .data(format!(r#"{{"taskId":"{id}","message":"chunk-one"}}"#))),
        Ok(Event::default()
            .event("progress")
            .data(format!(r#"{{"taskId":"{id}","message":"chunk-two"}}"#))),
        Ok(Event::default().event("complete").data(format!(
            r#"{{"taskId":"{id}","result":{{"output":"stub output","metrics":{{"duration_ms":7}}}}}}"#
        ))),
    ];
    // Paced so that tests attaching a second subscriber right after the
    // first still observe the full script through the shared downstream.
    let stream = futures_util::stream::iter(frames).then(|frame| async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        frame
    });
    Sse::new(stream)
}

/// Start the stub worker on an ephemeral port; returns its base URL and the
/// shared counters.
pub async fn start() -> (String, StubState) {
    let state = StubState::new();
    let app = Router::new()
        .route("/health", get(health))
        .route("/run", post(run))
        .route("/tasks/{id}", get(task_status))
        .route("/stream/{id}", get(stream))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), state)
}
