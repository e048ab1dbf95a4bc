//! Per-task event hub for the worker's SSE endpoint
//!
//! The execution engine publishes progress and lifecycle events here; each
//! SSE subscriber gets its own broadcast receiver. The terminal event is
//! retained for a short grace window so a client attaching just after
//! completion still receives it.

use shared::events::TaskEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

/// How long a finished task's channel (and terminal event) stays around for
/// late subscribers
const TERMINAL_RETENTION: Duration = Duration::from_secs(5);

struct ChannelEntry {
    tx: broadcast::Sender<TaskEvent>,
    /// Retained terminal event, replayed to late subscribers
    terminal: Option<TaskEvent>,
}

pub struct EventBus {
    channels: Mutex<HashMap<Uuid, ChannelEntry>>,
    capacity: usize,
}

/// A subscription handle: live receiver plus an optional terminal event that
/// was published before the subscriber attached.
pub struct Subscription {
    pub receiver: broadcast::Receiver<TaskEvent>,
    pub replay_terminal: Option<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Create the channel for a newly accepted task.
    pub async fn register(&self, task_id: Uuid) {
        let mut channels = self.channels.lock().await;
        channels.entry(task_id).or_insert_with(|| ChannelEntry {
            tx: broadcast::channel(self.capacity).0,
            terminal: None,
        });
    }

    /// Publish an event to all current subscribers of a task. Terminal
    /// events additionally schedule the channel for removal after a grace
    /// window.
    pub async fn publish(self: &Arc<Self>, task_id: Uuid, event: TaskEvent) {
        let is_terminal = event.is_terminal();
        {
            let mut channels = self.channels.lock().await;
            let Some(entry) = channels.get_mut(&task_id) else {
                debug!(%task_id, "Dropping event for unregistered task");
                return;
            };
            if is_terminal {
                entry.terminal = Some(event.clone());
            }
            // No subscribers is fine; events are not queued for absent clients.
            let _ = entry.tx.send(event);
        }
        if is_terminal {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(TERMINAL_RETENTION).await;
                bus.remove(task_id).await;
            });
        }
    }

    /// Subscribe to a task's events. Returns None for unknown tasks.
    pub async fn subscribe(&self, task_id: Uuid) -> Option<Subscription> {
        let channels = self.channels.lock().await;
        channels.get(&task_id).map(|entry| Subscription {
            receiver: entry.tx.subscribe(),
            replay_terminal: entry.terminal.clone(),
        })
    }

    /// Drop a task's channel, ending every subscriber stream.
    pub async fn remove(&self, task_id: Uuid) {
        self.channels.lock().await.remove(&task_id);
    }

    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::task::TaskStatus;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Arc::new(EventBus::new(16));
        let task_id = Uuid::new_v4();
        bus.register(task_id).await;

        let mut sub = bus.subscribe(task_id).await.unwrap();
        assert!(sub.replay_terminal.is_none());

        bus.publish(
            task_id,
            TaskEvent::Progress {
                message: "chunk".to_string(),
                percentage: None,
            },
        )
        .await;

        let event = sub.receiver.recv().await.unwrap();
        assert!(matches!(event, TaskEvent::Progress { .. }));
    }

    #[tokio::test]
    async fn test_terminal_event_is_replayed_to_late_subscriber() {
        let bus = Arc::new(EventBus::new(16));
        let task_id = Uuid::new_v4();
        bus.register(task_id).await;

        bus.publish(
            task_id,
            TaskEvent::Failed {
                error: "boom".to_string(),
                retryable: false,
            },
        )
        .await;

        let sub = bus.subscribe(task_id).await.unwrap();
        assert!(matches!(
            sub.replay_terminal,
            Some(TaskEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_status_counts_as_terminal() {
        let bus = Arc::new(EventBus::new(16));
        let task_id = Uuid::new_v4();
        bus.register(task_id).await;
        bus.publish(
            task_id,
            TaskEvent::Status {
                status: TaskStatus::Cancelled,
            },
        )
        .await;
        let sub = bus.subscribe(task_id).await.unwrap();
        assert!(sub.replay_terminal.is_some());
    }

    #[tokio::test]
    async fn test_unknown_task_has_no_subscription() {
        let bus = Arc::new(EventBus::new(16));
        assert!(bus.subscribe(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_ends_subscriber_stream() {
        let bus = Arc::new(EventBus::new(16));
        let task_id = Uuid::new_v4();
        bus.register(task_id).await;
        let mut sub = bus.subscribe(task_id).await.unwrap();
        bus.remove(task_id).await;
        assert!(matches!(
            sub.receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(bus.channel_count().await, 0);
    }
}
