//! Shared data structures and utilities for the ClaudeCluster dispatcher
//!
//! This crate contains common types, configuration structures, and utilities
//! used by both the coordinator and worker components.

pub mod api;
pub mod config;
pub mod defaults;
pub mod events;
pub mod sse;
pub mod task;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{endpoints, headers, SubmitTaskRequest, WorkerStatus};
pub use config::{CoordinatorConfig, WorkerConfig};
pub use task::{ExecutionMode, Task, TaskResult, TaskStatus};
pub use utils::validate_worker_id;

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Error kinds surfaced across the cluster.
///
/// Each variant maps onto one of the client-visible error classes; the
/// `retryable` hint tells clients whether resubmitting the same task can
/// reasonably succeed.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No workers available")]
    NoWorkers,

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Task timed out after {0} ms")]
    Timeout(u64),

    #[error("Executor error: {message}")]
    Executor { message: String, retryable: bool },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Whether a client may retry the request that produced this error.
    pub fn retryable(&self) -> bool {
        match self {
            ClusterError::Validation(_) => false,
            ClusterError::NoWorkers => true,
            ClusterError::CapacityExceeded(_) => true,
            ClusterError::DispatchFailed(_) => false,
            ClusterError::Timeout(_) => false,
            ClusterError::Executor { retryable, .. } => *retryable,
            ClusterError::Internal(_) => false,
        }
    }

    /// Short machine-readable kind tag included in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::Validation(_) => "validation",
            ClusterError::NoWorkers => "no_workers",
            ClusterError::CapacityExceeded(_) => "capacity_exceeded",
            ClusterError::DispatchFailed(_) => "dispatch_failed",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Executor { .. } => "executor_error",
            ClusterError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClusterError::NoWorkers.retryable());
        assert!(ClusterError::CapacityExceeded("full".to_string()).retryable());
        assert!(!ClusterError::Validation("bad".to_string()).retryable());
        assert!(!ClusterError::Timeout(1000).retryable());
        assert!(ClusterError::Executor {
            message: "image pull failed".to_string(),
            retryable: true
        }
        .retryable());
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(ClusterError::NoWorkers.kind(), "no_workers");
        assert_eq!(
            ClusterError::DispatchFailed("connection refused".to_string()).kind(),
            "dispatch_failed"
        );
    }
}
