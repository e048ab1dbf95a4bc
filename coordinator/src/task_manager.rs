//! Task intake, dispatch, and lifecycle tracking on the coordinator
//!
//! The task manager validates client submissions, asks the registry for a
//! worker, forwards the task with a single-shot POST, and reconciles
//! completion either from relayed stream events or by polling the worker's
//! status endpoint as a fallback. Terminal tasks are swept by a periodic GC.

use chrono::Utc;
use shared::api::{
    endpoints, headers, CancelTaskResponse, ErrorBody, RunTaskResponse, SubmitTaskRequest,
    SubmitTaskResponse, TaskCounts, TaskStatusResponse,
};
use shared::task::{Task, TaskStatus};
use shared::utils::calculate_backoff_delay;
use shared::ClusterError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::WorkerRegistry;

/// Ceiling on the per-task polling backoff
const MAX_POLL_BACKOFF_MS: u64 = 60_000;

/// Coordinator-side record of one task
struct TaskEntry {
    task: Task,
    /// Endpoint of the worker the task ran on
    assigned_endpoint: Option<String>,
    /// Registry id of that worker
    assigned_worker_id: Option<String>,
    output: Option<String>,
    error: Option<String>,
    duration_ms: Option<u64>,
    /// Completed poll attempts since the task started running
    poll_attempts: u32,
    /// Earliest moment the polling fallback may query the worker again
    next_poll_at: Option<Instant>,
}

impl TaskEntry {
    fn status_response(&self, task_id: Uuid) -> TaskStatusResponse {
        TaskStatusResponse {
            task_id,
            status: self.task.status,
            assigned_worker: self.assigned_endpoint.clone(),
            created_at: self.task.created_at,
            started_at: self.task.started_at,
            completed_at: self.task.completed_at,
            output: self.output.clone(),
            error: self.error.clone(),
            progress: self.task.status.is_terminal().then_some(100),
            duration_ms: self.duration_ms,
        }
    }
}

/// A terminal observation, from the SSE relay or the polling fallback
#[derive(Debug, Clone)]
pub struct TerminalNotice {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

pub struct TaskManager {
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    registry: Arc<WorkerRegistry>,
    http: reqwest::Client,
    api_key: Option<String>,
    /// Base URL advertised in stream URLs; relative paths when unset
    public_base_url: Option<String>,
    /// Base delay before the polling fallback first queries a running task;
    /// doubles per attempt up to `MAX_POLL_BACKOFF_MS`
    poll_backoff_base_ms: u64,
    completed_total: AtomicUsize,
    failed_total: AtomicUsize,
}

impl TaskManager {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        dispatch_timeout: Duration,
        poll_backoff_base: Duration,
        api_key: Option<String>,
        public_base_url: Option<String>,
    ) -> shared::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(dispatch_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build dispatch HTTP client: {}", e))?;
        Ok(TaskManager {
            tasks: Mutex::new(HashMap::new()),
            registry,
            http,
            api_key,
            public_base_url: public_base_url.map(|base| base.trim_end_matches('/').to_string()),
            poll_backoff_base_ms: poll_backoff_base.as_millis() as u64,
            completed_total: AtomicUsize::new(0),
            failed_total: AtomicUsize::new(0),
        })
    }

    fn stream_url(&self, task_id: Uuid) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}{}", base, endpoints::stream_path(&task_id)),
            None => endpoints::stream_path(&task_id),
        }
    }

    /// Accept a submission: validate, select a worker, dispatch, record.
    ///
    /// Dispatch is at-most-once; a transport failure or worker rejection
    /// records the task as failed with the reason preserved and never
    /// retries transparently.
    pub async fn submit(
        &self,
        request: SubmitTaskRequest,
    ) -> Result<SubmitTaskResponse, ClusterError> {
        let task = Task::from_request(request.clone())?;
        let task_id = task.id;

        let selected = self
            .registry
            .select_worker(task.requested_worker.as_deref())
            .await
            .ok_or(ClusterError::NoWorkers)?;

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    assigned_endpoint: None,
                    assigned_worker_id: None,
                    output: None,
                    error: None,
                    duration_ms: None,
                    poll_attempts: 0,
                    next_poll_at: None,
                },
            );
        }

        info!(
            %task_id,
            worker_id = %selected.id,
            endpoint = %selected.endpoint,
            "Dispatching task"
        );

        let run_request = request.into_run_request(task_id);
        let url = format!("{}{}", selected.endpoint, endpoints::RUN);
        let mut dispatch = self.http.post(&url).json(&run_request);
        if let Some(api_key) = &self.api_key {
            dispatch = dispatch.header(headers::API_KEY, api_key);
        }

        let response = match dispatch.send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = format!("worker unreachable: {}", e);
                self.record_dispatch_failure(task_id, &reason).await;
                return Err(ClusterError::DispatchFailed(reason));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|e| format!("unreadable error body: {}", e));
            let reason = format!("worker returned {}: {}", status, detail);
            self.record_dispatch_failure(task_id, &reason).await;
            // A capacity rejection keeps its retryable classification.
            if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                return Err(ClusterError::CapacityExceeded(reason));
            }
            return Err(ClusterError::DispatchFailed(reason));
        }

        let run_response: RunTaskResponse = response.json().await.map_err(|e| {
            ClusterError::DispatchFailed(format!("invalid worker response: {}", e))
        })?;

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.assigned_endpoint = Some(selected.endpoint.clone());
                entry.assigned_worker_id = Some(selected.id.clone());
                // pending -> assigned -> running; the worker accepted it.
                let _ = entry.task.transition(TaskStatus::Assigned);
                let _ = entry.task.transition(TaskStatus::Running);
                // The SSE relay is the primary completion signal; polling
                // only starts once the backoff window has passed.
                entry.next_poll_at =
                    Some(Instant::now() + Duration::from_millis(self.poll_backoff_base_ms));
            }
        }
        self.registry.on_dispatch(&selected.id).await;

        Ok(SubmitTaskResponse {
            task_id,
            status: TaskStatus::Running,
            assigned_worker: Some(selected.endpoint),
            estimated_duration_ms: run_response.estimated_duration_ms,
            stream_url: self.stream_url(task_id),
        })
    }

    async fn record_dispatch_failure(&self, task_id: Uuid, reason: &str) {
        warn!(%task_id, reason, "Dispatch failed");
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get_mut(&task_id) {
            let _ = entry.task.transition(TaskStatus::Failed);
            entry.error = Some(reason.to_string());
        }
        self.failed_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Status snapshot of one task
    pub async fn get(&self, task_id: Uuid) -> Option<TaskStatusResponse> {
        let tasks = self.tasks.lock().await;
        tasks.get(&task_id).map(|entry| entry.status_response(task_id))
    }

    /// Worker endpoint a running task is assigned to
    pub async fn assigned_endpoint(&self, task_id: Uuid) -> Option<String> {
        let tasks = self.tasks.lock().await;
        tasks.get(&task_id).and_then(|entry| entry.assigned_endpoint.clone())
    }

    /// Forward a best-effort cancel to the assigned worker. Idempotent.
    pub async fn cancel(&self, task_id: Uuid) -> Result<CancelTaskResponse, ClusterError> {
        let (status, endpoint) = {
            let tasks = self.tasks.lock().await;
            let entry = tasks.get(&task_id).ok_or_else(|| {
                ClusterError::Validation(format!("unknown task {}", task_id))
            })?;
            (entry.task.status, entry.assigned_endpoint.clone())
        };

        if status.is_terminal() {
            return Ok(CancelTaskResponse {
                task_id,
                status,
                cancelled: false,
            });
        }
        let Some(endpoint) = endpoint else {
            // Never reached a worker; nothing to cancel remotely.
            return Ok(CancelTaskResponse {
                task_id,
                status,
                cancelled: false,
            });
        };

        let url = format!("{}{}", endpoint, endpoints::task_path(&task_id));
        let mut request = self.http.delete(&url);
        if let Some(api_key) = &self.api_key {
            request = request.header(headers::API_KEY, api_key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let cancel: CancelTaskResponse = response.json().await.map_err(|e| {
                    ClusterError::DispatchFailed(format!("invalid cancel response: {}", e))
                })?;
                if cancel.status.is_terminal() {
                    self.apply_terminal(TerminalNotice {
                        task_id,
                        status: cancel.status,
                        output: None,
                        error: None,
                        duration_ms: None,
                    })
                    .await;
                }
                Ok(CancelTaskResponse {
                    task_id,
                    status: cancel.status,
                    cancelled: cancel.cancelled,
                })
            }
            Ok(response) => Err(ClusterError::DispatchFailed(format!(
                "cancel rejected by worker: {}",
                response.status()
            ))),
            Err(e) => Err(ClusterError::DispatchFailed(format!(
                "worker unreachable for cancel: {}",
                e
            ))),
        }
    }

    /// Fold a terminal observation into the record. Idempotent: the first
    /// observation wins, later ones are ignored.
    pub async fn apply_terminal(&self, notice: TerminalNotice) {
        let worker_id = {
            let mut tasks = self.tasks.lock().await;
            let Some(entry) = tasks.get_mut(&notice.task_id) else {
                debug!(task_id = %notice.task_id, "Terminal notice for unknown task");
                return;
            };
            if entry.task.status.is_terminal() {
                return;
            }
            if entry.task.transition(notice.status).is_err() {
                warn!(
                    task_id = %notice.task_id,
                    status = %notice.status,
                    "Rejected terminal transition"
                );
                return;
            }
            if notice.output.is_some() {
                entry.output = notice.output;
            }
            if notice.error.is_some() {
                entry.error = notice.error;
            }
            if notice.duration_ms.is_some() {
                entry.duration_ms = notice.duration_ms;
            }
            entry.assigned_worker_id.clone()
        };

        match notice.status {
            TaskStatus::Completed => {
                self.completed_total.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                self.failed_total.fetch_add(1, Ordering::SeqCst);
            }
        }
        if let Some(worker_id) = worker_id {
            self.registry.on_terminal(&worker_id).await;
        }
        info!(task_id = %notice.task_id, status = %notice.status, "Task reconciled");
    }

    /// Polling fallback for completion reconciliation: query the worker for
    /// running tasks whose backoff window has elapsed and fold terminal
    /// answers in. Each unanswered poll doubles a task's backoff, bounded at
    /// `MAX_POLL_BACKOFF_MS`. Returns the ids that just went terminal so the
    /// caller can close their streams.
    pub async fn poll_running(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let targets: Vec<(Uuid, String, u32)> = {
            let mut tasks = self.tasks.lock().await;
            tasks
                .iter_mut()
                .filter(|(_, entry)| entry.task.status == TaskStatus::Running)
                .filter_map(|(task_id, entry)| {
                    if entry.next_poll_at.is_some_and(|due| due > now) {
                        return None;
                    }
                    entry.poll_attempts = entry.poll_attempts.saturating_add(1);
                    let backoff_ms = calculate_backoff_delay(
                        entry.poll_attempts,
                        self.poll_backoff_base_ms,
                        MAX_POLL_BACKOFF_MS,
                    );
                    entry.next_poll_at = Some(now + Duration::from_millis(backoff_ms));
                    entry
                        .assigned_endpoint
                        .clone()
                        .map(|endpoint| (*task_id, endpoint, entry.poll_attempts))
                })
                .collect()
        };

        let mut reconciled = Vec::new();
        for (task_id, endpoint, attempt) in targets {
            debug!(%task_id, attempt, "Polling worker for task status");
            let url = format!("{}{}", endpoint, endpoints::task_path(&task_id));
            let mut request = self.http.get(&url);
            if let Some(api_key) = &self.api_key {
                request = request.header(headers::API_KEY, api_key);
            }
            let status = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<TaskStatusResponse>().await {
                        Ok(status) => status,
                        Err(e) => {
                            debug!(%task_id, error = %e, "Unreadable status poll response");
                            continue;
                        }
                    }
                }
                Ok(response) => {
                    debug!(%task_id, status = %response.status(), "Status poll rejected");
                    continue;
                }
                Err(e) => {
                    debug!(%task_id, error = %e, "Status poll failed");
                    continue;
                }
            };
            if status.status.is_terminal() {
                self.apply_terminal(TerminalNotice {
                    task_id,
                    status: status.status,
                    output: status.output,
                    error: status.error,
                    duration_ms: status.duration_ms,
                })
                .await;
                reconciled.push(task_id);
            }
        }
        reconciled
    }

    /// Drop terminal tasks older than `max_age` from the in-memory index.
    pub async fn gc_sweep(&self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, entry| {
            !(entry.task.status.is_terminal()
                && entry.task.completed_at.is_some_and(|t| t < cutoff))
        });
        let removed = before - tasks.len();
        if removed > 0 {
            info!(removed, remaining = tasks.len(), "Swept terminal tasks");
        }
    }

    pub async fn counts(&self) -> TaskCounts {
        let tasks = self.tasks.lock().await;
        TaskCounts {
            active: tasks
                .values()
                .filter(|entry| !entry.task.status.is_terminal())
                .count(),
            completed: self.completed_total.load(Ordering::SeqCst),
            failed: self.failed_total.load(Ordering::SeqCst),
        }
    }
}
