//! Session glue: the runtime binding of a task to an acquired executor
//!
//! A session exists for every task run. It owns the cancellation signal that
//! timeout, external cancel, and worker shutdown all flow through, and it is
//! only marked terminated after the engine has released the executor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::task::ExecutionMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle states of a session
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Active,
    Idle,
    Terminating,
    Terminated,
    Error,
}

pub struct Session {
    pub id: Uuid,
    pub task_id: Uuid,
    pub executor_id: Uuid,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    status: SessionStatus,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    deadline_guard: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Bind a task to an executor with a deadline. The deadline fires the
    /// session's cancellation token; the token is a child of the worker-wide
    /// shutdown token so that shutdown cancels every session the same way.
    pub fn new(
        task_id: Uuid,
        executor_id: Uuid,
        mode: ExecutionMode,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));

        let deadline_token = cancel.clone();
        let deadline_flag = Arc::clone(&timed_out);
        let deadline_guard = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    deadline_flag.store(true, Ordering::SeqCst);
                    deadline_token.cancel();
                }
                _ = deadline_token.cancelled() => {}
            }
        });

        Session {
            id: Uuid::new_v4(),
            task_id,
            executor_id,
            mode,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
            status: SessionStatus::Active,
            cancel,
            timed_out,
            deadline_guard,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The cancellation token shared by timeout, external cancel, and
    /// shutdown
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the cancellation was caused by the deadline
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark the session as winding down while the executor is reclaimed
    pub fn begin_termination(&mut self) {
        if self.status != SessionStatus::Terminated {
            self.status = SessionStatus::Terminating;
        }
    }

    /// Mark the session terminated. Must only be called after the executor
    /// has been released; consuming the session enforces that it cannot be
    /// used afterwards.
    pub fn terminate(mut self) {
        self.deadline_guard.abort();
        self.status = SessionStatus::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_fires_cancellation() {
        let parent = CancellationToken::new();
        let session = Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionMode::ProcessPool,
            Duration::from_millis(50),
            &parent,
        );
        assert!(!session.is_cancelled());
        session.cancel_token().cancelled().await;
        assert!(session.is_timed_out());
        session.terminate();
    }

    #[tokio::test]
    async fn test_external_cancel_is_not_a_timeout() {
        let parent = CancellationToken::new();
        let session = Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionMode::ProcessPool,
            Duration::from_secs(60),
            &parent,
        );
        session.cancel_token().cancel();
        session.cancel_token().cancelled().await;
        assert!(!session.is_timed_out());
        session.terminate();
    }

    #[tokio::test]
    async fn test_parent_shutdown_cancels_session() {
        let parent = CancellationToken::new();
        let session = Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionMode::ProcessPool,
            Duration::from_secs(60),
            &parent,
        );
        parent.cancel();
        session.cancel_token().cancelled().await;
        assert!(!session.is_timed_out());
        session.terminate();
    }

    #[tokio::test]
    async fn test_session_status_transitions() {
        let parent = CancellationToken::new();
        let mut session = Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ExecutionMode::ProcessPool,
            Duration::from_secs(60),
            &parent,
        );
        assert_eq!(session.status(), SessionStatus::Active);
        session.begin_termination();
        assert_eq!(session.status(), SessionStatus::Terminating);
        session.terminate();
    }
}
