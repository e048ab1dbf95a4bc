//! Executor state machine and variant dispatch
//!
//! An executor is a transient handle capable of running a single task at a
//! time. Two variants exist: a reusable process-backed executor driving the
//! agent CLI on a pseudo-terminal, and a one-shot container-backed executor
//! created and destroyed per task. The engine only sees the tagged sum and
//! dispatches by variant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::task::{ExecutionMode, Task, TaskResult};
use shared::ClusterError;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::container::ContainerExecutor;
use crate::process::ProcessExecutor;

/// Lifecycle states of an executor.
///
/// Reusable process executors cycle `idle -> executing -> idle`; one-shot
/// container executors go `executing -> terminated` on release. Any state
/// may move to `error` or through `terminating` to `terminated`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Initializing,
    Idle,
    Executing,
    Terminating,
    Terminated,
    Error,
}

impl ExecutorState {
    /// Whether the executor can accept a task in this state
    pub fn can_execute(&self) -> bool {
        matches!(self, ExecutorState::Idle)
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutorState::Initializing => "initializing",
            ExecutorState::Idle => "idle",
            ExecutorState::Executing => "executing",
            ExecutorState::Terminating => "terminating",
            ExecutorState::Terminated => "terminated",
            ExecutorState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource usage of an executor
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

/// Snapshot of an executor's bookkeeping fields
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub id: Uuid,
    pub mode: ExecutionMode,
    pub state: ExecutorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub last_activity: DateTime<Utc>,
    pub resource_usage: ResourceUsage,
}

/// Concrete executor variants, dispatched by tag.
pub enum Executor {
    Process(ProcessExecutor),
    Container(ContainerExecutor),
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::Process(_) => f.debug_tuple("Process").finish(),
            Executor::Container(_) => f.debug_tuple("Container").finish(),
        }
    }
}

impl Executor {
    /// Stable identifier of this executor instance
    pub fn id(&self) -> Uuid {
        match self {
            Executor::Process(inner) => inner.id(),
            Executor::Container(inner) => inner.id(),
        }
    }

    /// Execution mode tag, used by the unified provider to route releases
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Executor::Process(_) => ExecutionMode::ProcessPool,
            Executor::Container(_) => ExecutionMode::ContainerAgentic,
        }
    }

    /// Run one task to completion, streaming captured output chunks into
    /// `chunks` as they arrive.
    ///
    /// Exclusive: fails with an invalid-state error when the executor is not
    /// idle. On success the result carries the full captured output; the
    /// chunks channel only exists for live streaming and may be dropped by
    /// the receiver without affecting execution.
    pub async fn execute(
        &mut self,
        task: &Task,
        chunks: mpsc::Sender<String>,
    ) -> Result<TaskResult, ClusterError> {
        match self {
            Executor::Process(inner) => inner.execute(task, chunks).await,
            Executor::Container(inner) => inner.execute(task, chunks).await,
        }
    }

    /// Release OS resources and transition to `terminated`. Idempotent.
    pub async fn terminate(&mut self) -> Result<(), ClusterError> {
        match self {
            Executor::Process(inner) => inner.terminate().await,
            Executor::Container(inner) => inner.terminate().await,
        }
    }

    /// Cheap predicate: is this executor usable for another task
    pub fn is_healthy(&self) -> bool {
        match self {
            Executor::Process(inner) => inner.is_healthy(),
            Executor::Container(inner) => inner.is_healthy(),
        }
    }

    /// Snapshot of the executor's bookkeeping fields
    pub fn status(&self) -> ExecutorStatus {
        match self {
            Executor::Process(inner) => inner.status(),
            Executor::Container(inner) => inner.status(),
        }
    }

    /// Duration of the most recently completed task, for pool statistics
    pub fn last_task_duration_ms(&self) -> Option<u64> {
        match self {
            Executor::Process(inner) => inner.last_task_duration_ms(),
            Executor::Container(inner) => inner.last_task_duration_ms(),
        }
    }
}

/// Error used by all variants when `execute` is called while not idle
pub fn invalid_state_error(state: ExecutorState) -> ClusterError {
    ClusterError::Executor {
        message: format!("executor not idle (state: {})", state),
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_can_execute() {
        assert!(ExecutorState::Idle.can_execute());
        assert!(!ExecutorState::Initializing.can_execute());
        assert!(!ExecutorState::Executing.can_execute());
        assert!(!ExecutorState::Terminated.can_execute());
        assert!(!ExecutorState::Error.can_execute());
    }

    #[test]
    fn test_invalid_state_error_is_not_retryable() {
        let err = invalid_state_error(ExecutorState::Executing);
        match err {
            ClusterError::Executor { retryable, message } => {
                assert!(!retryable);
                assert!(message.contains("executing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
