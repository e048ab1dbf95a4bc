//! REST API implementation for the worker
//!
//! Exposes the health, task submission, task status/cancel, and SSE stream
//! endpoints consumed by the coordinator (and usable directly for
//! debugging). When an API key is configured, every endpoint except health
//! requires it in the `X-Api-Key` header.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::Stream;
use shared::api::{
    endpoints, headers, CancelTaskResponse, ErrorBody, RunTaskRequest, RunTaskResponse,
    WorkerHealthResponse, WorkerStatus,
};
use shared::config::WorkerConfig;
use shared::events::{self, TaskEvent};
use shared::task::TaskStatus;
use shared::ClusterError;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::TaskExecutionEngine;
use crate::events::{EventBus, Subscription};

/// Worker version from Cargo.toml
const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum request body size: 1 MB (prompts cap at 10k chars; the rest is
/// metadata headroom)
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Delay between a terminal event and closing the subscriber stream, so the
/// final frame drains before the writer goes away
const TERMINAL_DRAIN: Duration = Duration::from_secs(1);

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WorkerConfig>,
    pub engine: Arc<TaskExecutionEngine>,
    pub events: Arc<EventBus>,
    /// Resolved API key; None disables auth
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(
        config: Arc<WorkerConfig>,
        engine: Arc<TaskExecutionEngine>,
        events: Arc<EventBus>,
        api_key: Option<String>,
    ) -> Self {
        AppState {
            config,
            engine,
            events,
            api_key,
        }
    }
}

/// Creates the worker API router. Called once at startup.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(health_check))
        .route(endpoints::RUN, axum::routing::post(handle_run))
        .route("/tasks/{id}", get(handle_task_status).delete(handle_task_cancel))
        .route("/stream/{id}", get(handle_stream))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// Constant-time API key check; mirrors the coordinator's handling so keys
/// cannot be probed character-by-character.
fn validate_api_key(headers: &HeaderMap, expected: &Option<String>) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let Some(expected_key) = expected else {
        return Ok(());
    };
    let provided = headers
        .get(headers::API_KEY)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() {
        warn!("Missing API key header");
        return Err(ApiError::Unauthorized);
    }

    let matches = provided.len() == expected_key.len()
        && bool::from(provided.as_bytes().ct_eq(expected_key.as_bytes()));
    if !matches {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// The handler for the `/health` endpoint. Unauthenticated: the coordinator
/// probes it to derive worker status.
async fn health_check(State(state): State<AppState>) -> Json<WorkerHealthResponse> {
    let active = state.engine.active_tasks() as u32;
    let max = state.engine.max_concurrent() as u32;
    let status = if !state.engine.is_accepting() {
        WorkerStatus::Offline
    } else if active >= max {
        WorkerStatus::Busy
    } else {
        WorkerStatus::Available
    };

    Json(WorkerHealthResponse {
        status,
        worker_id: state.config.worker_id.clone(),
        name: state.config.display_name().to_string(),
        version: WORKER_VERSION.to_string(),
        active_tasks: active,
        max_tasks: max,
        total_tasks_executed: state.engine.total_executed(),
        uptime_ms: state.engine.uptime_ms(),
        capabilities: state.config.capabilities.clone(),
        execution_mode: state.config.execution_mode,
    })
}

/// The handler for task submission.
async fn handle_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RunTaskRequest>,
) -> Result<Json<RunTaskResponse>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    let response = state.engine.submit(request).await?;
    Ok(Json(response))
}

/// Status snapshot of one task owned by this worker.
async fn handle_task_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    match state.engine.status(id).await {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::NotFound),
    }
}

/// Best-effort cancel; idempotent.
async fn handle_task_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelTaskResponse>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    match state.engine.cancel(id).await {
        Some((status, cancelled)) => Ok(Json(CancelTaskResponse {
            task_id: id,
            status,
            cancelled,
        })),
        None => Err(ApiError::NotFound),
    }
}

/// SSE stream of one task's progress. Stays open until the task reaches a
/// terminal state or the client disconnects.
async fn handle_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;

    let subscription = state.events.subscribe(id).await;
    if subscription.is_none() {
        // The live channel is gone; replay the terminal state for tasks the
        // engine still remembers, otherwise the task is unknown.
        let Some(status) = state.engine.status(id).await else {
            return Err(ApiError::NotFound);
        };
        if !status.status.is_terminal() {
            return Err(ApiError::NotFound);
        }
    }

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(state.config.sse_client_buffer);
    let heartbeat_interval = Duration::from_millis(state.config.sse_heartbeat_interval_ms);
    let write_deadline = Duration::from_millis(state.config.sse_write_deadline_ms);
    let engine = Arc::clone(&state.engine);

    tokio::spawn(async move {
        match subscription {
            Some(subscription) => {
                forward_events(
                    id,
                    subscription,
                    tx,
                    heartbeat_interval,
                    write_deadline,
                )
                .await;
            }
            None => {
                // Late subscriber to a finished task: one synthesized
                // terminal frame, then close.
                let event = match engine.result(id).await {
                    Some(result) => match result.status {
                        TaskStatus::Completed => Some(TaskEvent::Complete {
                            result: Box::new(result),
                        }),
                        status => {
                            Some(terminal_event_for(&status, result.error.as_deref()))
                        }
                    },
                    None => engine
                        .status(id)
                        .await
                        .map(|s| terminal_event_for(&s.status, s.error.as_deref())),
                };
                if let Some(event) = event {
                    let frame = event.to_frame(id);
                    let _ = tx
                        .send(Ok(sse_event_from(frame.event.as_deref(), &frame.data)))
                        .await;
                }
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

fn terminal_event_for(status: &TaskStatus, error: Option<&str>) -> TaskEvent {
    match status {
        TaskStatus::Cancelled => TaskEvent::Status {
            status: TaskStatus::Cancelled,
        },
        TaskStatus::Failed => TaskEvent::Failed {
            error: error.unwrap_or("task failed").to_string(),
            retryable: false,
        },
        _ => TaskEvent::Status { status: *status },
    }
}

fn sse_event_from(name: Option<&str>, data: &str) -> Event {
    let event = Event::default().data(data);
    match name {
        Some(name) => event.event(name),
        None => event,
    }
}

/// Pump one subscriber: broadcast events plus periodic heartbeats, until the
/// task finishes, the client disconnects, or the client blocks past the
/// write deadline.
async fn forward_events(
    task_id: Uuid,
    mut subscription: Subscription,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    heartbeat_interval: Duration,
    write_deadline: Duration,
) {
    let connected = Instant::now();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );

    let send = |event: Event| {
        let tx = tx.clone();
        async move {
            tokio::time::timeout(write_deadline, tx.send(Ok(event)))
                .await
                .map(|sent| sent.is_ok())
                .unwrap_or(false)
        }
    };

    if let Some(terminal) = subscription.replay_terminal.take() {
        let frame = terminal.to_frame(task_id);
        let _ = send(sse_event_from(frame.event.as_deref(), &frame.data)).await;
        return;
    }

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => match event {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    let frame = event.to_frame(task_id);
                    if !send(sse_event_from(frame.event.as_deref(), &frame.data)).await {
                        debug!(%task_id, "SSE subscriber gone; dropping");
                        break;
                    }
                    if terminal {
                        tokio::time::sleep(TERMINAL_DRAIN).await;
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%task_id, skipped, "SSE subscriber lagging; dropping");
                    let payload = events::error_payload(task_id, "subscriber lagged behind event stream");
                    let _ = send(sse_event_from(Some(events::event_names::ERROR), &payload.to_string())).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                let payload = events::heartbeat_payload(
                    task_id,
                    connected.elapsed().as_millis() as u64,
                    events::SOURCE_WORKER,
                );
                if !send(sse_event_from(Some(events::event_names::HEARTBEAT), &payload.to_string())).await {
                    break;
                }
            }
        }
    }
}

/// Custom error types for the worker API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", false),
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
