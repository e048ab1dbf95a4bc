//! SSE event payloads for task progress streaming
//!
//! Workers emit these events on their `/stream/{id}` endpoint; the
//! coordinator relays them to subscribed clients, wrapping each payload in
//! an envelope that records the relay hop.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::sse::SseFrame;
use crate::task::{TaskResult, TaskStatus};

/// Origin tag for events produced by a worker
pub const SOURCE_WORKER: &str = "worker";
/// Origin tag for events produced by the coordinator itself
pub const SOURCE_COORDINATOR: &str = "mcp-server";
/// Relay tag added to every forwarded event
pub const RELAYED_BY: &str = "mcp-server";

/// SSE event names used on both stream surfaces
pub mod event_names {
    pub const STATUS: &str = "status";
    pub const PROGRESS: &str = "progress";
    pub const COMPLETE: &str = "complete";
    pub const FAILED: &str = "failed";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const ERROR: &str = "error";
}

/// One event in a task's progress stream, as published by the worker engine.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Lifecycle state transition
    Status { status: TaskStatus },
    /// A chunk of captured output, with optional completion estimate
    Progress {
        message: String,
        percentage: Option<u8>,
    },
    /// Terminal success, carrying the full result
    Complete { result: Box<TaskResult> },
    /// Terminal failure
    Failed { error: String, retryable: bool },
}

impl TaskEvent {
    /// SSE event name for this event
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Status { .. } => event_names::STATUS,
            TaskEvent::Progress { .. } => event_names::PROGRESS,
            TaskEvent::Complete { .. } => event_names::COMPLETE,
            TaskEvent::Failed { .. } => event_names::FAILED,
        }
    }

    /// Whether this event ends the stream. Cancellation surfaces as a
    /// `status` event carrying a terminal state.
    pub fn is_terminal(&self) -> bool {
        match self {
            TaskEvent::Complete { .. } | TaskEvent::Failed { .. } => true,
            TaskEvent::Status { status } => status.is_terminal(),
            TaskEvent::Progress { .. } => false,
        }
    }

    /// JSON payload for the `data:` field of the SSE frame
    pub fn to_payload(&self, task_id: Uuid) -> Value {
        let base = json!({
            "taskId": task_id,
            "timestamp": Utc::now().to_rfc3339(),
            "source": SOURCE_WORKER,
        });
        let mut payload = base;
        let object = payload.as_object_mut().expect("payload is an object");
        match self {
            TaskEvent::Status { status } => {
                object.insert("status".to_string(), json!(status));
            }
            TaskEvent::Progress {
                message,
                percentage,
            } => {
                object.insert("message".to_string(), json!(message));
                if let Some(percentage) = percentage {
                    object.insert("percentage".to_string(), json!(percentage));
                }
            }
            TaskEvent::Complete { result } => {
                object.insert("result".to_string(), json!(result));
            }
            TaskEvent::Failed { error, retryable } => {
                object.insert("error".to_string(), json!(error));
                object.insert("retryable".to_string(), json!(retryable));
            }
        }
        payload
    }

    /// Render this event as a wire-level SSE frame
    pub fn to_frame(&self, task_id: Uuid) -> SseFrame {
        SseFrame {
            event: Some(self.name().to_string()),
            data: self.to_payload(task_id).to_string(),
            id: None,
        }
    }
}

/// Payload for a per-client heartbeat frame
pub fn heartbeat_payload(task_id: Uuid, connection_uptime_ms: u64, source: &str) -> Value {
    json!({
        "taskId": task_id,
        "timestamp": Utc::now().to_rfc3339(),
        "source": source,
        "connectionUptimeMs": connection_uptime_ms,
    })
}

/// Payload for the shutdown notice sent to every subscriber
pub fn server_shutdown_payload(reason: &str) -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "source": SOURCE_COORDINATOR,
        "reason": reason,
    })
}

/// Payload for a stream-level error notice (e.g. downstream loss)
pub fn error_payload(task_id: Uuid, error: &str) -> Value {
    json!({
        "taskId": task_id,
        "timestamp": Utc::now().to_rfc3339(),
        "source": SOURCE_COORDINATOR,
        "error": error,
    })
}

/// Wrap a relayed worker payload in the coordinator envelope.
///
/// JSON objects gain `source` (defaulted to `worker` when absent),
/// `relayedBy`, and `mcpTimestamp`. Anything that does not parse as a JSON
/// object is forwarded unchanged.
pub fn envelope_relayed(data: &str) -> String {
    let mut value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => return data.to_string(),
    };
    match value.as_object_mut() {
        Some(object) => {
            object
                .entry("source".to_string())
                .or_insert_with(|| json!(SOURCE_WORKER));
            object.insert("relayedBy".to_string(), json!(RELAYED_BY));
            object.insert(
                "mcpTimestamp".to_string(),
                json!(Utc::now().to_rfc3339()),
            );
            value.to_string()
        }
        None => data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(
            TaskEvent::Status {
                status: TaskStatus::Running
            }
            .name(),
            "status"
        );
        assert_eq!(
            TaskEvent::Failed {
                error: "boom".to_string(),
                retryable: false
            }
            .name(),
            "failed"
        );
    }

    #[test]
    fn test_progress_payload_fields() {
        let task_id = Uuid::new_v4();
        let event = TaskEvent::Progress {
            message: "compiling".to_string(),
            percentage: Some(40),
        };
        let payload = event.to_payload(task_id);
        assert_eq!(payload["taskId"], json!(task_id));
        assert_eq!(payload["source"], json!("worker"));
        assert_eq!(payload["message"], json!("compiling"));
        assert_eq!(payload["percentage"], json!(40));
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_envelope_adds_relay_fields() {
        let wrapped = envelope_relayed(r#"{"taskId":"t1","message":"hi"}"#);
        let value: Value = serde_json::from_str(&wrapped).unwrap();
        assert_eq!(value["source"], json!("worker"));
        assert_eq!(value["relayedBy"], json!("mcp-server"));
        assert!(value["mcpTimestamp"].is_string());
        assert_eq!(value["message"], json!("hi"));
    }

    #[test]
    fn test_envelope_preserves_existing_source() {
        let wrapped = envelope_relayed(r#"{"source":"mcp-server"}"#);
        let value: Value = serde_json::from_str(&wrapped).unwrap();
        assert_eq!(value["source"], json!("mcp-server"));
    }

    #[test]
    fn test_envelope_forwards_non_json_unchanged() {
        assert_eq!(envelope_relayed("plain text"), "plain text");
        assert_eq!(envelope_relayed("[1,2,3]"), "[1,2,3]");
    }
}
