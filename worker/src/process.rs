//! Process-backed executor
//!
//! Wraps a long-lived agent CLI child opened on a pseudo-terminal. Tasks are
//! submitted as command lines written to the pty; output is captured until a
//! configured idle-silence window elapses or the pty closes. The executor is
//! reusable: on success it returns to `idle` and the child keeps running.
//!
//! Pty reads are blocking, so a dedicated reader thread pumps raw chunks
//! into an async channel for the executor to consume.

use chrono::Utc;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use shared::config::ProcessPoolConfig;
use shared::task::{Task, TaskMetrics, TaskResult};
use shared::ClusterError;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::executor::{invalid_state_error, ExecutorState, ExecutorStatus, ResourceUsage};

/// Size of the raw pty read buffer
const READ_BUFFER_BYTES: usize = 8 * 1024;
/// Capacity of the reader-thread to executor chunk channel
const CHUNK_CHANNEL_CAPACITY: usize = 256;

pub struct ProcessExecutor {
    id: Uuid,
    state: ExecutorState,
    current_task: Option<Uuid>,
    started_at: chrono::DateTime<Utc>,
    tasks_completed: u64,
    last_activity: chrono::DateTime<Utc>,
    last_duration_ms: Option<u64>,
    idle_silence: Duration,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    chunk_rx: mpsc::Receiver<Vec<u8>>,
    /// Cleared by the reader thread when the pty reaches EOF
    child_alive: Arc<AtomicBool>,
    /// Keeps the pty master end open for the lifetime of the executor
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessExecutor {
    /// Spawn the agent CLI on a fresh pty.
    ///
    /// This performs blocking process creation; callers on the async runtime
    /// should wrap it in `spawn_blocking`.
    pub fn spawn(config: &ProcessPoolConfig) -> Result<Self, ClusterError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(format!("failed to open pty: {}", e)))?;

        let mut command = CommandBuilder::new(&config.command);
        command.args(&config.args);
        command.cwd(&config.workspace_dir);
        command.env("TMPDIR", &config.temp_dir);
        if let Some(max_memory_mb) = config.max_memory_mb {
            command.env("CLAUDECLUSTER_MAX_MEMORY_MB", max_memory_mb.to_string());
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| spawn_error(format!("failed to spawn '{}': {}", config.command, e)))?;
        // Close the slave end in this process; the child keeps its own copy.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error(format!("failed to clone pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(format!("failed to take pty writer: {}", e)))?;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
        let child_alive = Arc::new(AtomicBool::new(true));
        let alive_flag = Arc::clone(&child_alive);
        let id = Uuid::new_v4();

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", id))
            .spawn(move || {
                let mut buffer = [0u8; READ_BUFFER_BYTES];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) | Err(_) => {
                            alive_flag.store(false, Ordering::SeqCst);
                            break;
                        }
                        Ok(n) => {
                            if chunk_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                                // Executor dropped; stop pumping.
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|e| spawn_error(format!("failed to start pty reader thread: {}", e)))?;

        debug!(executor_id = %id, command = %config.command, "Spawned process executor");

        Ok(ProcessExecutor {
            id,
            state: ExecutorState::Idle,
            current_task: None,
            started_at: Utc::now(),
            tasks_completed: 0,
            last_activity: Utc::now(),
            last_duration_ms: None,
            idle_silence: Duration::from_millis(config.idle_silence_ms),
            child,
            writer,
            chunk_rx,
            child_alive,
            _master: pair.master,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run one task: write the prompt to the pty and capture output until
    /// the idle-silence window elapses or the pty closes.
    pub async fn execute(
        &mut self,
        task: &Task,
        chunks: mpsc::Sender<String>,
    ) -> Result<TaskResult, ClusterError> {
        if !self.state.can_execute() {
            return Err(invalid_state_error(self.state));
        }
        self.state = ExecutorState::Executing;
        self.current_task = Some(task.id);
        self.last_activity = Utc::now();
        let started_at = Utc::now();
        let started = Instant::now();

        // Discard output left over from a previous command on this pty.
        while self.chunk_rx.try_recv().is_ok() {}

        if let Err(e) = self.write_command(&task.prompt) {
            self.state = ExecutorState::Error;
            return Err(e);
        }

        let mut output = String::new();
        loop {
            match tokio::time::timeout(self.idle_silence, self.chunk_rx.recv()).await {
                Ok(Some(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    output.push_str(&text);
                    // Streaming is best-effort; a dropped receiver must not
                    // interrupt capture.
                    let _ = chunks.send(text).await;
                }
                Ok(None) => {
                    // Pty closed: the agent process is gone.
                    self.state = ExecutorState::Error;
                    let exit_code = self.try_exit_code();
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.last_duration_ms = Some(duration_ms);
                    warn!(
                        executor_id = %self.id,
                        task_id = %task.id,
                        exit_code = ?exit_code,
                        "Agent process exited during execution"
                    );
                    return Ok(TaskResult::failed(
                        "agent process exited during execution".to_string(),
                        output,
                        TaskMetrics {
                            duration_ms,
                            exit_code,
                            ..Default::default()
                        },
                        started_at,
                    ));
                }
                Err(_) => {
                    // Silence window elapsed. Before the first output chunk
                    // this only means the agent is still thinking; afterwards
                    // it marks the end of the response.
                    if !output.is_empty() {
                        break;
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.state = ExecutorState::Idle;
        self.current_task = None;
        self.tasks_completed += 1;
        self.last_activity = Utc::now();
        self.last_duration_ms = Some(duration_ms);

        Ok(TaskResult::completed(
            output,
            TaskMetrics {
                duration_ms,
                ..Default::default()
            },
            started_at,
        ))
    }

    fn write_command(&mut self, prompt: &str) -> Result<(), ClusterError> {
        self.writer
            .write_all(prompt.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|e| ClusterError::Executor {
                message: format!("failed to write command to pty: {}", e),
                retryable: true,
            })
    }

    fn try_exit_code(&mut self) -> Option<i64> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(i64::from(status.exit_code())),
            _ => None,
        }
    }

    /// Kill the child and mark the executor terminated. Idempotent.
    pub async fn terminate(&mut self) -> Result<(), ClusterError> {
        if self.state == ExecutorState::Terminated {
            return Ok(());
        }
        self.state = ExecutorState::Terminating;
        if let Err(e) = self.child.kill() {
            // The child may already be gone; that still counts as terminated.
            debug!(executor_id = %self.id, error = %e, "Kill on process executor child failed");
        }
        self.child_alive.store(false, Ordering::SeqCst);
        self.state = ExecutorState::Terminated;
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.state, ExecutorState::Idle | ExecutorState::Executing)
            && self.child_alive.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            id: self.id,
            mode: shared::task::ExecutionMode::ProcessPool,
            state: self.state,
            current_task: self.current_task,
            started_at: self.started_at,
            tasks_completed: self.tasks_completed,
            last_activity: self.last_activity,
            resource_usage: ResourceUsage::default(),
        }
    }

    pub fn last_task_duration_ms(&self) -> Option<u64> {
        self.last_duration_ms
    }
}

fn spawn_error(message: String) -> ClusterError {
    ClusterError::Executor {
        message,
        retryable: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::api::SubmitTaskRequest;

    fn shell_config(idle_silence_ms: u64) -> ProcessPoolConfig {
        ProcessPoolConfig {
            command: "sh".to_string(),
            args: vec![],
            idle_silence_ms,
            workspace_dir: std::env::temp_dir().display().to_string(),
            ..Default::default()
        }
    }

    fn task(prompt: &str) -> Task {
        Task::from_request(SubmitTaskRequest {
            prompt: prompt.to_string(),
            priority: None,
            worker_id: None,
            metadata: None,
            timeout_ms: None,
            mode: None,
            repo_url: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_captures_shell_output() {
        let mut executor =
            tokio::task::spawn_blocking(|| ProcessExecutor::spawn(&shell_config(500)))
                .await
                .unwrap()
                .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let result = executor.execute(&task("echo cluster-test-marker"), tx).await.unwrap();
        assert!(result.output.contains("cluster-test-marker"));
        assert_eq!(result.status, shared::TaskStatus::Completed);
        assert!(result.metrics.duration_ms > 0);

        // Streamed chunks carry the same output
        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk);
        }
        assert!(streamed.contains("cluster-test-marker"));

        // Executor is reusable after success
        assert!(executor.is_healthy());
        let (tx, _rx) = mpsc::channel(16);
        let result = executor.execute(&task("echo second-run"), tx).await.unwrap();
        assert!(result.output.contains("second-run"));
        assert_eq!(executor.status().tasks_completed, 2);

        executor.terminate().await.unwrap();
        assert!(!executor.is_healthy());
    }

    #[tokio::test]
    async fn test_execute_rejected_when_not_idle() {
        let mut executor =
            tokio::task::spawn_blocking(|| ProcessExecutor::spawn(&shell_config(500)))
                .await
                .unwrap()
                .unwrap();
        executor.terminate().await.unwrap();
        // Terminate is idempotent
        executor.terminate().await.unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let err = executor.execute(&task("echo hi"), tx).await.unwrap_err();
        match err {
            ClusterError::Executor { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_child_fails_with_output_preserved() {
        // `sh -c 'exit 3'` dies immediately; the pty closes on the next read.
        let config = ProcessPoolConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo partial; exit 3".to_string()],
            idle_silence_ms: 200,
            workspace_dir: std::env::temp_dir().display().to_string(),
            ..Default::default()
        };
        let mut executor = tokio::task::spawn_blocking(move || ProcessExecutor::spawn(&config))
            .await
            .unwrap()
            .unwrap();

        // Give the child time to exit so the reader observes EOF.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while executor.chunk_rx.try_recv().is_ok() {}

        let (tx, _rx) = mpsc::channel(16);
        let result = executor.execute(&task("echo hi"), tx).await;
        // Either the write fails (pty torn down) or capture observes EOF;
        // both surface as a failure and the executor is no longer healthy.
        match result {
            Ok(task_result) => {
                assert_eq!(task_result.status, shared::TaskStatus::Failed);
                assert!(task_result.error.is_some());
            }
            Err(ClusterError::Executor { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
        assert!(!executor.is_healthy());
    }
}
