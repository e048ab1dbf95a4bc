//! Task model for the ClaudeCluster dispatcher
//!
//! This module defines the task lifecycle, execution results, and artifact
//! handles shared between the coordinator and its workers. A task is a
//! natural-language coding prompt routed to one worker and executed inside
//! exactly one executor for the duration of its run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::api::SubmitTaskRequest;
use crate::ClusterError;

/// Maximum accepted prompt length in characters
pub const MAX_PROMPT_CHARS: usize = 10_000;
/// Inclusive priority bounds
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
/// Default priority when the submission omits one
pub const DEFAULT_PRIORITY: u8 = 5;
/// Inclusive timeout bounds in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Lifecycle states of a task.
///
/// Transitions are monotonic along `pending -> assigned -> running` into one
/// of the terminal states; a task never leaves a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is allowed by the state graph
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Assigned => matches!(
                next,
                TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Running => next.is_terminal(),
            // Terminal states never regress
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Execution backend a task runs on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Reusable warm child process driving the agent CLI on a pty
    ProcessPool,
    /// One-shot container created and destroyed per task
    ContainerAgentic,
}

impl ExecutionMode {
    /// The other mode, used for failover routing
    pub fn other(&self) -> ExecutionMode {
        match self {
            ExecutionMode::ProcessPool => ExecutionMode::ContainerAgentic,
            ExecutionMode::ContainerAgentic => ExecutionMode::ProcessPool,
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::ProcessPool => f.write_str("process_pool"),
            ExecutionMode::ContainerAgentic => f.write_str("container_agentic"),
        }
    }
}

/// A unit of work submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque id assigned on submission
    pub id: Uuid,
    /// Natural-language coding prompt
    pub prompt: String,
    /// Scheduling priority, 1 (lowest) to 10 (highest)
    pub priority: u8,
    /// Explicitly requested worker id, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_worker: Option<String>,
    /// Requested timeout in milliseconds, bounded by the worker maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque client metadata, passed through untouched
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Requested execution mode, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    /// Optional repository the task operates on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Current lifecycle state
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a validated task from a client submission, assigning a fresh id.
    pub fn from_request(request: SubmitTaskRequest) -> Result<Self, ClusterError> {
        validate_prompt(&request.prompt)?;
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        validate_priority(priority)?;
        if let Some(timeout_ms) = request.timeout_ms {
            validate_timeout(timeout_ms)?;
        }
        if let Some(worker_id) = request.worker_id.as_deref() {
            crate::utils::validate_worker_id(worker_id)
                .map_err(|e| ClusterError::Validation(e.to_string()))?;
        }

        Ok(Task {
            id: Uuid::new_v4(),
            prompt: request.prompt,
            priority,
            requested_worker: request.worker_id,
            timeout_ms: request.timeout_ms,
            metadata: request.metadata.unwrap_or_default(),
            mode: request.mode,
            repo_url: request.repo_url,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Effective timeout for this task given the worker's upper bound.
    pub fn effective_timeout_ms(&self, worker_max_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(worker_max_ms).min(worker_max_ms)
    }

    /// Advance the lifecycle state, enforcing monotonic transitions.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ClusterError> {
        if !self.status.can_transition_to(next) {
            return Err(ClusterError::Internal(format!(
                "invalid task state transition {} -> {}",
                self.status, next
            )));
        }
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

/// Validate a submitted prompt against the accepted bounds
pub fn validate_prompt(prompt: &str) -> Result<(), ClusterError> {
    if prompt.is_empty() {
        return Err(ClusterError::Validation(
            "prompt must not be empty".to_string(),
        ));
    }
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(ClusterError::Validation(format!(
            "prompt too long: {} characters (max {})",
            chars, MAX_PROMPT_CHARS
        )));
    }
    Ok(())
}

/// Validate a submitted priority against the accepted bounds
pub fn validate_priority(priority: u8) -> Result<(), ClusterError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ClusterError::Validation(format!(
            "priority {} out of range ({}..={})",
            priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

/// Validate a submitted timeout against the accepted bounds
pub fn validate_timeout(timeout_ms: u64) -> Result<(), ClusterError> {
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
        return Err(ClusterError::Validation(format!(
            "timeoutMs {} out of range ({}..={})",
            timeout_ms, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
        )));
    }
    Ok(())
}

/// Kind of file produced by a task execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Directory,
    Report,
    Log,
    Data,
}

/// Handle to a file produced by a task execution.
///
/// Content is never inlined; large artifacts are surfaced by path only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Execution metrics attached to a task result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// Outcome of one task execution, attached to the task on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Terminal status of the run
    pub status: TaskStatus,
    /// Captured textual output
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    pub metrics: TaskMetrics,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl TaskResult {
    /// Build a completed result from captured output. The owning session is
    /// stamped on afterwards by the execution engine.
    pub fn completed(output: String, metrics: TaskMetrics, started_at: DateTime<Utc>) -> Self {
        TaskResult {
            status: TaskStatus::Completed,
            output,
            error: None,
            artifacts: Vec::new(),
            metrics,
            started_at,
            ended_at: Utc::now(),
            session_id: None,
        }
    }

    /// Build a failed result with partial output preserved.
    pub fn failed(
        error: String,
        output: String,
        metrics: TaskMetrics,
        started_at: DateTime<Utc>,
    ) -> Self {
        TaskResult {
            status: TaskStatus::Failed,
            output,
            error: Some(error),
            artifacts: Vec::new(),
            metrics,
            started_at,
            ended_at: Utc::now(),
            session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> SubmitTaskRequest {
        SubmitTaskRequest {
            prompt: prompt.to_string(),
            priority: None,
            worker_id: None,
            metadata: None,
            timeout_ms: None,
            mode: None,
            repo_url: None,
        }
    }

    #[test]
    fn test_prompt_bounds() {
        assert!(validate_prompt("echo hi").is_ok());
        assert!(validate_prompt("").is_err());
        assert!(validate_prompt(&"x".repeat(MAX_PROMPT_CHARS)).is_ok());
        assert!(validate_prompt(&"x".repeat(MAX_PROMPT_CHARS + 1)).is_err());
    }

    #[test]
    fn test_priority_bounds() {
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(10).is_ok());
        assert!(validate_priority(11).is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(validate_timeout(999).is_err());
        assert!(validate_timeout(1_000).is_ok());
        assert!(validate_timeout(600_000).is_ok());
        assert!(validate_timeout(600_001).is_err());
    }

    #[test]
    fn test_from_request_defaults_priority() {
        let task = Task::from_request(request("echo hi")).unwrap();
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_state_graph_is_monotonic() {
        let mut task = Task::from_request(request("echo hi")).unwrap();
        task.transition(TaskStatus::Assigned).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());
        // Terminal states never regress
        assert!(task.transition(TaskStatus::Running).is_err());
        assert!(task.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_effective_timeout_is_bounded() {
        let mut task = Task::from_request(request("echo hi")).unwrap();
        assert_eq!(task.effective_timeout_ms(300_000), 300_000);
        task.timeout_ms = Some(5_000);
        assert_eq!(task.effective_timeout_ms(300_000), 5_000);
        task.timeout_ms = Some(600_000);
        assert_eq!(task.effective_timeout_ms(300_000), 300_000);
    }

    #[test]
    fn test_status_serialization_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionMode::ContainerAgentic).unwrap(),
            "\"container_agentic\""
        );
        // States outside the documented set are rejected
        assert!(serde_json::from_str::<TaskStatus>("\"paused\"").is_err());
    }
}
