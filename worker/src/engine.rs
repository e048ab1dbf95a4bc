//! Task execution engine
//!
//! Accepts task submissions, obtains an executor from the unified provider,
//! runs the task under a session with timeout and cancellation, streams
//! output chunks into the event bus, records the result, and releases the
//! executor on every termination path.

use chrono::Utc;
use shared::api::{endpoints, RunTaskRequest, RunTaskResponse, TaskStatusResponse};
use shared::events::TaskEvent;
use shared::task::{
    self, Task, TaskMetrics, TaskResult, TaskStatus, DEFAULT_PRIORITY,
};
use shared::ClusterError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::executor::Executor;
use crate::session::Session;
use crate::unified::UnifiedProvider;

/// Capacity of the per-execution chunk channel between executor and engine
const CHUNK_CHANNEL_CAPACITY: usize = 64;
/// Poll interval while waiting out the shutdown grace window
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Worker-side record of one accepted task
struct TaskRecord {
    task: Task,
    result: Option<TaskResult>,
    cancel: CancellationToken,
    session_id: Option<Uuid>,
}

pub struct TaskExecutionEngine {
    provider: Arc<UnifiedProvider>,
    events: Arc<EventBus>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    max_concurrent: usize,
    session_timeout_ms: u64,
    active: AtomicUsize,
    total_executed: AtomicU64,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    started: Instant,
}

/// How one execution attempt ended, before bookkeeping
enum Outcome {
    Finished(Result<TaskResult, ClusterError>),
    Cancelled { timed_out: bool },
}

impl TaskExecutionEngine {
    pub fn new(
        provider: Arc<UnifiedProvider>,
        events: Arc<EventBus>,
        max_concurrent: usize,
        session_timeout_ms: u64,
    ) -> Self {
        TaskExecutionEngine {
            provider,
            events,
            tasks: Mutex::new(HashMap::new()),
            max_concurrent,
            session_timeout_ms,
            active: AtomicUsize::new(0),
            total_executed: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// Accept a task submission and start executing it in the background.
    ///
    /// Submission is bounded: hitting the configured concurrency cap rejects
    /// with a capacity error rather than queueing.
    pub async fn submit(
        self: &Arc<Self>,
        request: RunTaskRequest,
    ) -> Result<RunTaskResponse, ClusterError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ClusterError::CapacityExceeded(
                "worker is shutting down".to_string(),
            ));
        }

        task::validate_prompt(&request.prompt)?;
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        task::validate_priority(priority)?;
        if let Some(timeout_ms) = request.timeout_ms {
            task::validate_timeout(timeout_ms)?;
        }

        // Reserve a concurrency slot atomically; losing the race surfaces as
        // capacity exceeded, never as an over-admitted task.
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.max_concurrent).then_some(active + 1)
            })
            .map_err(|_| {
                ClusterError::CapacityExceeded(format!(
                    "worker at maximum concurrent tasks ({})",
                    self.max_concurrent
                ))
            })?;

        let task_id = request.task_id.unwrap_or_else(Uuid::new_v4);
        let mut task = Task {
            id: task_id,
            prompt: request.prompt,
            priority,
            requested_worker: None,
            timeout_ms: request.timeout_ms,
            metadata: request.metadata.unwrap_or_default(),
            mode: request.mode,
            repo_url: request.repo_url,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&task_id) {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(ClusterError::Validation(format!(
                    "task {} already submitted",
                    task_id
                )));
            }
            // Accepted: externally visible as `assigned` until execution starts.
            task.transition(TaskStatus::Assigned)
                .map_err(|e| ClusterError::Internal(e.to_string()))?;
            tasks.insert(
                task_id,
                TaskRecord {
                    task,
                    result: None,
                    cancel: self.shutdown.child_token(),
                    session_id: None,
                },
            );
        }

        self.events.register(task_id).await;
        self.events
            .publish(
                task_id,
                TaskEvent::Status {
                    status: TaskStatus::Assigned,
                },
            )
            .await;

        let estimated_duration_ms = self.provider.estimated_duration_ms().await;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_task(task_id).await;
        });

        info!(%task_id, "Task accepted");
        Ok(RunTaskResponse {
            task_id,
            status: TaskStatus::Assigned,
            estimated_duration_ms,
            stream_url: Some(endpoints::stream_path(&task_id)),
        })
    }

    /// Drive one task from acquisition through release. Every exit path
    /// funnels into `finish`, which releases the concurrency slot exactly
    /// once.
    async fn run_task(self: Arc<Self>, task_id: Uuid) {
        let (task, cancel) = {
            let tasks = self.tasks.lock().await;
            match tasks.get(&task_id) {
                Some(record) => (record.task.clone(), record.cancel.clone()),
                None => {
                    error!(%task_id, "Accepted task vanished before execution");
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        };

        let started_at = Utc::now();
        let mut executor = match self.provider.acquire(&task, None).await {
            Ok(executor) => executor,
            Err(e) => {
                warn!(%task_id, error = %e, "Executor acquisition failed");
                let result = TaskResult::failed(
                    format!("no-executor: {}", e),
                    String::new(),
                    TaskMetrics::default(),
                    started_at,
                );
                self.finish(task_id, TaskStatus::Failed, result, e.retryable())
                    .await;
                return;
            }
        };

        let timeout = Duration::from_millis(task.effective_timeout_ms(self.session_timeout_ms));
        let mut session = Session::new(task_id, executor.id(), executor.mode(), timeout, &cancel);
        debug!(
            session_id = %session.id,
            task_id = %session.task_id,
            executor_id = %session.executor_id,
            mode = %session.mode,
            session_status = ?session.status(),
            executor_state = %executor.status().state,
            created_at = %session.created_at,
            expires_at = %session.expires_at,
            "Session started"
        );
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(record) = tasks.get_mut(&task_id) {
                record.session_id = Some(session.id);
                if let Err(e) = record.task.transition(TaskStatus::Running) {
                    error!(%task_id, error = %e, "State transition rejected");
                }
            }
        }
        self.events
            .publish(
                task_id,
                TaskEvent::Status {
                    status: TaskStatus::Running,
                },
            )
            .await;

        // Forward captured output chunks into the event bus as they arrive.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(CHUNK_CHANNEL_CAPACITY);
        let chunk_events = Arc::clone(&self.events);
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                chunk_events
                    .publish(
                        task_id,
                        TaskEvent::Progress {
                            message: chunk,
                            percentage: None,
                        },
                    )
                    .await;
            }
        });

        let outcome = tokio::select! {
            result = executor.execute(&task, chunk_tx) => Outcome::Finished(result),
            _ = session.cancel_token().cancelled() => Outcome::Cancelled {
                timed_out: session.is_timed_out(),
            },
        };
        session.begin_termination();
        let _ = forwarder.await;

        let session_id = session.id;
        let (status, result, retryable) = match outcome {
            Outcome::Finished(Ok(mut result)) => {
                result.session_id = Some(session_id);
                let status = result.status;
                (status, result, false)
            }
            Outcome::Finished(Err(e)) => {
                let mut result = TaskResult::failed(
                    e.to_string(),
                    String::new(),
                    TaskMetrics::default(),
                    started_at,
                );
                result.session_id = Some(session_id);
                (TaskStatus::Failed, result, e.retryable())
            }
            Outcome::Cancelled { timed_out } => {
                debug_assert!(session.is_cancelled());
                // The execution future was dropped mid-flight; stop the
                // executor before handing it back.
                if let Err(e) = executor.terminate().await {
                    warn!(%task_id, error = %e, "Executor termination after cancel failed");
                }
                let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                let metrics = TaskMetrics {
                    duration_ms,
                    ..Default::default()
                };
                if timed_out {
                    let mut result = TaskResult::failed(
                        format!("timeout: task exceeded {} ms", timeout.as_millis()),
                        String::new(),
                        metrics,
                        started_at,
                    );
                    result.session_id = Some(session_id);
                    (TaskStatus::Failed, result, false)
                } else {
                    let result = TaskResult {
                        status: TaskStatus::Cancelled,
                        output: String::new(),
                        error: None,
                        artifacts: Vec::new(),
                        metrics,
                        started_at,
                        ended_at: Utc::now(),
                        session_id: Some(session_id),
                    };
                    (TaskStatus::Cancelled, result, false)
                }
            }
        };

        // The executor goes back to its provider before the task is marked
        // terminal; the session is only terminated after the release.
        self.provider.release(executor).await;
        session.terminate();
        self.finish(task_id, status, result, retryable).await;
    }

    /// Record the terminal state, emit the terminal event, and free the
    /// concurrency slot. Called exactly once per accepted task.
    async fn finish(&self, task_id: Uuid, status: TaskStatus, result: TaskResult, retryable: bool) {
        let event = match status {
            TaskStatus::Completed => TaskEvent::Complete {
                result: Box::new(result.clone()),
            },
            TaskStatus::Cancelled => TaskEvent::Status {
                status: TaskStatus::Cancelled,
            },
            _ => TaskEvent::Failed {
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
                retryable,
            },
        };

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(record) = tasks.get_mut(&task_id) {
                if let Err(e) = record.task.transition(status) {
                    // A concurrent cancel may have already sealed the record.
                    debug!(%task_id, error = %e, "Terminal transition rejected");
                } else {
                    record.result = Some(result);
                }
            }
        }

        // Publish after the record is terminal so pollers and subscribers
        // cannot observe a terminal event before a terminal status.
        let events = Arc::clone(&self.events);
        events.publish(task_id, event).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.total_executed.fetch_add(1, Ordering::SeqCst);
        info!(%task_id, %status, "Task finished");
    }

    /// Best-effort cancel. Idempotent: repeated calls observe the same
    /// terminal state.
    pub async fn cancel(&self, task_id: Uuid) -> Option<(TaskStatus, bool)> {
        let tasks = self.tasks.lock().await;
        let record = tasks.get(&task_id)?;
        if record.task.status.is_terminal() {
            return Some((record.task.status, false));
        }
        record.cancel.cancel();
        Some((record.task.status, true))
    }

    /// Status snapshot of one task
    pub async fn status(&self, task_id: Uuid) -> Option<TaskStatusResponse> {
        let tasks = self.tasks.lock().await;
        let record = tasks.get(&task_id)?;
        let result = record.result.as_ref();
        Some(TaskStatusResponse {
            task_id,
            status: record.task.status,
            assigned_worker: None,
            created_at: record.task.created_at,
            started_at: record.task.started_at,
            completed_at: record.task.completed_at,
            output: result.map(|r| r.output.clone()),
            error: result.and_then(|r| r.error.clone()),
            progress: record.task.status.is_terminal().then_some(100),
            duration_ms: result.map(|r| r.metrics.duration_ms),
        })
    }

    /// Full result of a finished task, if recorded
    pub async fn result(&self, task_id: Uuid) -> Option<TaskResult> {
        let tasks = self.tasks.lock().await;
        tasks.get(&task_id).and_then(|record| record.result.clone())
    }

    /// Drop terminal task records older than `max_age`.
    pub async fn gc(&self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, record| {
            !(record.task.status.is_terminal()
                && record.task.completed_at.is_some_and(|t| t < cutoff))
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, remaining = tasks.len(), "Swept terminal task records");
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_executed(&self) -> u64 {
        self.total_executed.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting work, give in-flight tasks a grace window, then cancel
    /// the rest through their sessions and shut the providers down.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(
            active = self.active_tasks(),
            grace_ms = grace.as_millis() as u64,
            "Engine draining in-flight tasks"
        );

        let deadline = Instant::now() + grace;
        while self.active_tasks() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        if self.active_tasks() > 0 {
            warn!(
                active = self.active_tasks(),
                "Grace window elapsed; cancelling remaining tasks"
            );
            self.shutdown.cancel();
            let force_deadline = Instant::now() + Duration::from_secs(5);
            while self.active_tasks() > 0 && Instant::now() < force_deadline {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        }

        self.provider.cleanup().await;
        info!("Engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProcessPoolProvider;
    use shared::config::ProcessPoolConfig;
    use shared::task::ExecutionMode;

    fn engine(max_concurrent: usize) -> Arc<TaskExecutionEngine> {
        let pool = ProcessPoolProvider::new(ProcessPoolConfig {
            command: "sh".to_string(),
            min: 0,
            max: 2,
            idle_silence_ms: 300,
            acquire_timeout_ms: 2_000,
            workspace_dir: std::env::temp_dir().display().to_string(),
            ..Default::default()
        });
        let provider = Arc::new(
            UnifiedProvider::new(Some(pool), None, ExecutionMode::ProcessPool, true).unwrap(),
        );
        Arc::new(TaskExecutionEngine::new(
            provider,
            Arc::new(EventBus::new(64)),
            max_concurrent,
            60_000,
        ))
    }

    fn run_request(prompt: &str, timeout_ms: Option<u64>) -> RunTaskRequest {
        RunTaskRequest {
            task_id: None,
            prompt: prompt.to_string(),
            priority: None,
            metadata: None,
            timeout_ms,
            mode: None,
            repo_url: None,
        }
    }

    async fn wait_terminal(
        engine: &Arc<TaskExecutionEngine>,
        task_id: Uuid,
        max_wait: Duration,
    ) -> TaskStatusResponse {
        let deadline = Instant::now() + max_wait;
        loop {
            let status = engine.status(task_id).await.expect("task known");
            if status.status.is_terminal() {
                return status;
            }
            assert!(Instant::now() < deadline, "task did not reach terminal state");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_executes_and_records_result() {
        let engine = engine(2);
        let response = engine
            .submit(run_request("echo engine-marker", None))
            .await
            .unwrap();
        assert_eq!(response.status, TaskStatus::Assigned);
        assert!(response.stream_url.is_some());

        let status = wait_terminal(&engine, response.task_id, Duration::from_secs(15)).await;
        assert_eq!(status.status, TaskStatus::Completed);
        assert!(status.output.unwrap().contains("engine-marker"));
        assert!(status.duration_ms.unwrap() > 0);
        assert_eq!(engine.active_tasks(), 0);
        assert_eq!(engine.total_executed(), 1);
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_capacity_bound_rejects_excess_submissions() {
        let engine = engine(1);
        let first = engine
            .submit(run_request("sleep 5 && echo done", None))
            .await
            .unwrap();

        let err = engine
            .submit(run_request("echo queued", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::CapacityExceeded(_)));

        engine.cancel(first.task_id).await.unwrap();
        wait_terminal(&engine, first.task_id, Duration::from_secs(10)).await;
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_submissions() {
        let engine = engine(2);
        assert!(matches!(
            engine.submit(run_request("", None)).await.unwrap_err(),
            ClusterError::Validation(_)
        ));
        assert!(matches!(
            engine
                .submit(run_request("echo hi", Some(999)))
                .await
                .unwrap_err(),
            ClusterError::Validation(_)
        ));
        let mut bad_priority = run_request("echo hi", None);
        bad_priority.priority = Some(11);
        assert!(matches!(
            engine.submit(bad_priority).await.unwrap_err(),
            ClusterError::Validation(_)
        ));
        // No slots leaked by rejected submissions
        assert_eq!(engine.active_tasks(), 0);
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_timeout_produces_failed_with_reason() {
        let engine = engine(2);
        let response = engine
            .submit(run_request("sleep 30", Some(1_000)))
            .await
            .unwrap();

        let status = wait_terminal(&engine, response.task_id, Duration::from_secs(15)).await;
        assert_eq!(status.status, TaskStatus::Failed);
        assert!(status.error.unwrap().contains("timeout"));
        assert_eq!(engine.active_tasks(), 0);
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let engine = engine(2);
        let response = engine
            .submit(run_request("sleep 30", None))
            .await
            .unwrap();

        let (_, initiated) = engine.cancel(response.task_id).await.unwrap();
        assert!(initiated);
        let status = wait_terminal(&engine, response.task_id, Duration::from_secs(15)).await;
        assert_eq!(status.status, TaskStatus::Cancelled);

        // Second cancel observes the same terminal state and is a no-op
        let (status_again, initiated) = engine.cancel(response.task_id).await.unwrap();
        assert_eq!(status_again, TaskStatus::Cancelled);
        assert!(!initiated);
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_gc_sweeps_only_old_terminal_tasks() {
        let engine = engine(2);
        let response = engine.submit(run_request("echo gc", None)).await.unwrap();
        wait_terminal(&engine, response.task_id, Duration::from_secs(15)).await;

        // Young terminal task survives
        engine.gc(Duration::from_secs(3600)).await;
        assert!(engine.status(response.task_id).await.is_some());

        // Zero max-age sweeps it
        engine.gc(Duration::ZERO).await;
        assert!(engine.status(response.task_id).await.is_none());
        engine.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_intake() {
        let engine = engine(2);
        engine.shutdown(Duration::from_millis(100)).await;
        let err = engine.submit(run_request("echo hi", None)).await.unwrap_err();
        assert!(matches!(err, ClusterError::CapacityExceeded(_)));
    }
}
