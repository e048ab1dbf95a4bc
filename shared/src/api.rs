//! API types and structures for coordinator and worker communication
//!
//! This module defines the request and response types used by the REST API
//! endpoints: client to coordinator, and coordinator to worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::task::{ExecutionMode, TaskStatus};

/// Observed status of a worker, as tracked by the coordinator registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Healthy with spare capacity
    Available,
    /// Healthy but at its concurrency cap
    Busy,
    /// Probe failed; not selectable
    Offline,
    /// Worker reported an internal fault
    Error,
}

impl WorkerStatus {
    /// Whether the registry may route new tasks to a worker in this state
    pub fn is_selectable(&self) -> bool {
        matches!(self, WorkerStatus::Available | WorkerStatus::Busy)
    }
}

/// Request body for POST /tasks (client -> coordinator)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub repo_url: Option<String>,
}

/// Response body for POST /tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    pub stream_url: String,
}

/// Response body for GET /tasks/{id}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Response body for DELETE /tasks/{id}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Whether this call initiated a cancellation (false when already terminal)
    pub cancelled: bool,
}

/// Worker and task counters reported by the coordinator health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub available: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCounts {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Response body for the coordinator GET /health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorHealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,
    pub workers: WorkerCounts,
    pub tasks: TaskCounts,
    pub version: String,
}

/// Serializable view of one worker record, as listed by GET /workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub active_tasks: u32,
    pub max_tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
}

/// Response body for GET /workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersResponse {
    pub workers: Vec<WorkerSnapshot>,
    pub total_workers: usize,
    pub available_workers: usize,
    pub total_active_tasks: u32,
}

/// Request body for POST /run (coordinator -> worker)
///
/// The coordinator forwards its own task id so that both sides address the
/// task by the same identifier; direct submissions omit it and the worker
/// assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub repo_url: Option<String>,
}

/// Response body for POST /run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

/// Response body for the worker GET /health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealthResponse {
    pub status: WorkerStatus,
    pub worker_id: String,
    pub name: String,
    pub version: String,
    pub active_tasks: u32,
    pub max_tasks: u32,
    pub total_tasks_executed: u64,
    pub uptime_ms: u64,
    pub capabilities: Vec<String>,
    pub execution_mode: ExecutionMode,
}

/// Error body returned by both HTTP surfaces on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// HTTP headers used for authentication
pub mod headers {
    pub const API_KEY: &str = "X-Api-Key";
}

/// API endpoint paths shared by both surfaces
pub mod endpoints {
    pub const HEALTH: &str = "/health";
    pub const TASKS: &str = "/tasks";
    pub const WORKERS: &str = "/workers";
    pub const RUN: &str = "/run";

    /// Path of the status endpoint for one task
    pub fn task_path(task_id: &uuid::Uuid) -> String {
        format!("/tasks/{}", task_id)
    }

    /// Path of the SSE stream endpoint for one task
    pub fn stream_path(task_id: &uuid::Uuid) -> String {
        format!("/stream/{}", task_id)
    }
}

impl SubmitTaskRequest {
    /// Convert a client submission into the worker-facing run request.
    pub fn into_run_request(self, task_id: Uuid) -> RunTaskRequest {
        RunTaskRequest {
            task_id: Some(task_id),
            prompt: self.prompt,
            priority: self.priority,
            metadata: self.metadata,
            timeout_ms: self.timeout_ms,
            mode: self.mode,
            repo_url: self.repo_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_status_serialization() {
        let available = WorkerStatus::Available;
        let json = serde_json::to_string(&available).unwrap();
        assert_eq!(json, "\"available\"");

        let offline = WorkerStatus::Offline;
        let json = serde_json::to_string(&offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }

    #[test]
    fn test_worker_status_selectability() {
        assert!(WorkerStatus::Available.is_selectable());
        assert!(WorkerStatus::Busy.is_selectable());
        assert!(!WorkerStatus::Offline.is_selectable());
        assert!(!WorkerStatus::Error.is_selectable());
    }

    #[test]
    fn test_submit_request_uses_camel_case() {
        let body = r#"{"prompt":"echo hi","timeoutMs":5000,"workerId":"w1"}"#;
        let request: SubmitTaskRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.timeout_ms, Some(5000));
        assert_eq!(request.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_run_request_carries_task_id() {
        let request = SubmitTaskRequest {
            prompt: "echo hi".to_string(),
            priority: Some(7),
            worker_id: Some("w1".to_string()),
            metadata: None,
            timeout_ms: None,
            mode: None,
            repo_url: None,
        };
        let task_id = Uuid::new_v4();
        let run = request.into_run_request(task_id);
        assert_eq!(run.task_id, Some(task_id));
        assert_eq!(run.priority, Some(7));
    }

    #[test]
    fn test_endpoint_path_helpers() {
        let id = Uuid::nil();
        assert_eq!(
            endpoints::task_path(&id),
            "/tasks/00000000-0000-0000-0000-000000000000"
        );
        assert!(endpoints::stream_path(&id).starts_with("/stream/"));
    }
}
