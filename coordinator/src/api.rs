//! REST API implementation for the ClaudeCluster coordinator
//!
//! This module provides the client-facing HTTP endpoints: health, task
//! submission and status, the SSE progress stream, and the worker listing.
// Each public handler corresponds to one endpoint; routing state is a single
// cheaply clonable AppState whose fields are shared Arcs.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::Stream;
use shared::api::{
    endpoints, CancelTaskResponse, CoordinatorHealthResponse, ErrorBody, SubmitTaskRequest,
    SubmitTaskResponse, TaskStatusResponse, WorkerCounts, WorkersResponse,
};
use shared::sse::SseFrame;
use shared::task::TaskStatus;
use shared::ClusterError;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use crate::registry::WorkerRegistry;
use crate::sse_relay::SseRelay;
use crate::task_manager::TaskManager;

/// Coordinator version from Cargo.toml
const COORDINATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum request body size: 1 MB
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub tasks: Arc<TaskManager>,
    pub relay: Arc<SseRelay>,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: Arc<WorkerRegistry>, tasks: Arc<TaskManager>, relay: Arc<SseRelay>) -> Self {
        AppState {
            registry,
            tasks,
            relay,
            started: Instant::now(),
        }
    }
}

/// Creates the main API router. Called once at coordinator startup.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(health_check))
        .route(endpoints::TASKS, axum::routing::post(handle_submit))
        .route("/tasks/{id}", get(handle_task_status).delete(handle_task_cancel))
        .route("/stream/{id}", get(handle_stream))
        .route(endpoints::WORKERS, get(handle_workers))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// The handler for the `/health` endpoint. Healthy requires at least one
/// selectable worker; a cluster with every worker offline reports 503.
async fn health_check(State(state): State<AppState>) -> Response {
    let worker_counts = state.registry.counts().await;
    let task_counts = state.tasks.counts().await;
    let healthy = worker_counts.total > worker_counts.offline;

    let body = CoordinatorHealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: chrono::Utc::now(),
        uptime_ms: state.started.elapsed().as_millis() as u64,
        workers: WorkerCounts {
            total: worker_counts.total,
            available: worker_counts.available,
            offline: worker_counts.offline,
        },
        tasks: task_counts,
        version: COORDINATOR_VERSION.to_string(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Task intake: validate, pick a worker, dispatch, reply with the stream URL.
async fn handle_submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, ApiError> {
    let response = state.tasks.submit(request).await?;
    Ok(Json(response))
}

/// Current status snapshot of a task.
async fn handle_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    match state.tasks.get(id).await {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::NotFound),
    }
}

/// Best-effort cancel, forwarded to the assigned worker.
async fn handle_task_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelTaskResponse>, ApiError> {
    let response = state.tasks.cancel(id).await?;
    Ok(Json(response))
}

/// SSE stream of one task's progress, relayed from its worker.
async fn handle_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Some(status) = state.tasks.get(id).await else {
        return Err(ApiError::NotFound);
    };

    let receiver = if status.status.is_terminal() {
        // The run is over; replay one terminal frame instead of opening a
        // downstream connection to the worker.
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let frame = terminal_replay_frame(id, &status);
        tokio::spawn(async move {
            let _ = tx.send(frame).await;
        });
        rx
    } else {
        let Some(endpoint) = state.tasks.assigned_endpoint(id).await else {
            // Known but never dispatched; there is no stream to relay.
            return Err(ApiError::NotFound);
        };
        state.relay.subscribe(id, endpoint).await
    };

    let stream = ReceiverStream::new(receiver).map(frame_to_event);
    Ok(Sse::new(stream))
}

fn frame_to_event(frame: SseFrame) -> Result<Event, Infallible> {
    // Raw (non-JSON) payloads may carry newlines, which the SSE writer
    // rejects; flatten them rather than dropping the frame.
    let data = if frame.data.contains(['\n', '\r']) {
        frame.data.replace(['\n', '\r'], " ")
    } else {
        frame.data
    };
    let mut event = Event::default().data(data);
    if let Some(name) = frame.event {
        event = event.event(name);
    }
    if let Some(id) = frame.id {
        event = event.id(id);
    }
    Ok(event)
}

fn terminal_replay_frame(task_id: Uuid, status: &TaskStatusResponse) -> SseFrame {
    let event = match status.status {
        TaskStatus::Completed => shared::events::event_names::COMPLETE,
        TaskStatus::Cancelled => shared::events::event_names::STATUS,
        _ => shared::events::event_names::FAILED,
    };
    let payload = serde_json::json!({
        "taskId": task_id,
        "status": status.status,
        "output": status.output,
        "error": status.error,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "source": shared::events::SOURCE_COORDINATOR,
    });
    SseFrame {
        event: Some(event.to_string()),
        data: payload.to_string(),
        id: None,
    }
}

/// Worker listing with aggregate counts.
async fn handle_workers(State(state): State<AppState>) -> Json<WorkersResponse> {
    let workers = state.registry.snapshot().await;
    let counts = state.registry.counts().await;
    Json(WorkersResponse {
        workers,
        total_workers: counts.total,
        available_workers: counts.available,
        total_active_tasks: counts.total_active_tasks,
    })
}

/// Custom error types for the coordinator API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", false),
            ApiError::Cluster(e) => {
                let status = match e {
                    ClusterError::Validation(_) => StatusCode::BAD_REQUEST,
                    ClusterError::NoWorkers | ClusterError::CapacityExceeded(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    ClusterError::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
                    ClusterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    ClusterError::Executor { .. } | ClusterError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.kind(), e.retryable())
            }
        };

        let body = Json(ErrorBody {
            error: self.to_string(),
            kind: kind.to_string(),
            retryable,
            details: None,
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let response = ApiError::Cluster(ClusterError::NoWorkers).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response =
            ApiError::Cluster(ClusterError::Validation("bad".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            ApiError::Cluster(ClusterError::DispatchFailed("down".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = ApiError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_frame_to_event_flattens_raw_newlines() {
        let frame = SseFrame {
            event: None,
            data: "line1\nline2".to_string(),
            id: None,
        };
        // Must not panic on multi-line raw payloads
        let _ = frame_to_event(frame);
    }

    #[test]
    fn test_terminal_replay_frame_names() {
        let status = TaskStatusResponse {
            task_id: Uuid::nil(),
            status: TaskStatus::Completed,
            assigned_worker: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            output: Some("hi".to_string()),
            error: None,
            progress: Some(100),
            duration_ms: Some(10),
        };
        let frame = terminal_replay_frame(Uuid::nil(), &status);
        assert_eq!(frame.event.as_deref(), Some("complete"));
        assert!(frame.data.contains("\"hi\""));
    }
}
