//! SSE relay: fan worker event streams out to subscribed clients
//!
//! For each task with at least one subscriber the relay opens exactly one
//! downstream SSE connection to the assigned worker, parses the frames,
//! wraps each payload in the relay envelope, and broadcasts them to every
//! subscriber. Clients each get their own heartbeats and are dropped
//! individually when they lag or block; the downstream stays open while any
//! client remains.

use shared::events::{self, SOURCE_COORDINATOR};
use shared::sse::{SseFrame, SseParser};
use shared::task::TaskStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task_manager::TerminalNotice;

/// Delay between a terminal frame and closing subscriber writers
const TERMINAL_DRAIN: Duration = Duration::from_secs(1);
/// Grace before the per-task entry is discarded after terminal
const ENTRY_GRACE: Duration = Duration::from_secs(5);

struct RelayEntry {
    tx: broadcast::Sender<SseFrame>,
    clients: usize,
    downstream: JoinHandle<()>,
}

pub struct SseRelay {
    entries: Mutex<HashMap<Uuid, RelayEntry>>,
    /// Dedicated client without a request timeout: SSE responses are
    /// open-ended by design
    http: reqwest::Client,
    api_key: Option<String>,
    heartbeat_interval: Duration,
    client_buffer: usize,
    write_deadline: Duration,
    /// Terminal observations flow to the task manager through this channel
    terminal_tx: mpsc::Sender<TerminalNotice>,
    shutting_down: AtomicBool,
}

impl SseRelay {
    pub fn new(
        api_key: Option<String>,
        heartbeat_interval: Duration,
        client_buffer: usize,
        write_deadline: Duration,
        terminal_tx: mpsc::Sender<TerminalNotice>,
    ) -> shared::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build relay HTTP client: {}", e))?;
        Ok(SseRelay {
            entries: Mutex::new(HashMap::new()),
            http,
            api_key,
            heartbeat_interval,
            client_buffer,
            write_deadline,
            terminal_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Attach a client to a task's stream, opening the downstream connection
    /// if this is the first subscriber. Returns the client's frame feed.
    pub async fn subscribe(
        self: &Arc<Self>,
        task_id: Uuid,
        worker_endpoint: String,
    ) -> mpsc::Receiver<SseFrame> {
        if self.shutting_down.load(Ordering::SeqCst) {
            // No new streams during shutdown; the closed channel ends the
            // client response immediately.
            let (_tx, rx) = mpsc::channel(1);
            return rx;
        }
        let frame_rx = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&task_id) {
                Some(entry) => {
                    entry.clients += 1;
                    debug!(%task_id, clients = entry.clients, "Client joined existing stream");
                    entry.tx.subscribe()
                }
                None => {
                    let (tx, rx) = broadcast::channel(self.client_buffer);
                    let relay = Arc::clone(self);
                    let downstream_tx = tx.clone();
                    let downstream = tokio::spawn(async move {
                        relay
                            .run_downstream(task_id, worker_endpoint, downstream_tx)
                            .await;
                    });
                    entries.insert(
                        task_id,
                        RelayEntry {
                            tx,
                            clients: 1,
                            downstream,
                        },
                    );
                    info!(%task_id, "Opened downstream worker stream");
                    rx
                }
            }
        };

        let (client_tx, client_rx) = mpsc::channel(self.client_buffer);
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.run_client(task_id, frame_rx, client_tx).await;
            relay.remove_client(task_id).await;
        });
        client_rx
    }

    /// Read the worker's SSE stream, envelope every frame, and broadcast it.
    async fn run_downstream(
        self: Arc<Self>,
        task_id: Uuid,
        worker_endpoint: String,
        tx: broadcast::Sender<SseFrame>,
    ) {
        use futures_util::StreamExt;

        let url = format!(
            "{}{}",
            worker_endpoint.trim_end_matches('/'),
            shared::api::endpoints::stream_path(&task_id)
        );
        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(api_key) = &self.api_key {
            request = request.header(shared::api::headers::API_KEY, api_key);
        }

        let response = match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                // Downstream loss closes only the downstream; subscribers
                // get one error event and the polling fallback reconciles.
                warn!(%task_id, error = %e, "Failed to open downstream stream");
                let _ = tx.send(error_frame(task_id, "worker stream unavailable"));
                return;
            }
        };

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%task_id, error = %e, "Downstream read failed");
                    let _ = tx.send(error_frame(task_id, "worker stream interrupted"));
                    return;
                }
            };
            for frame in parser.feed(&bytes) {
                // A payload that is not JSON is forwarded unchanged with its
                // original event type; a parse failure never breaks the stream.
                let enveloped = SseFrame {
                    event: frame.event.clone(),
                    data: events::envelope_relayed(&frame.data),
                    id: frame.id.clone(),
                };
                let notice = terminal_notice_from_frame(task_id, &frame);
                let _ = tx.send(enveloped);

                if let Some(notice) = notice {
                    debug!(%task_id, status = %notice.status, "Downstream observed terminal event");
                    if self.terminal_tx.send(notice).await.is_err() {
                        warn!(%task_id, "Reconciler channel closed");
                    }
                    self.schedule_close(task_id);
                    return;
                }
            }
        }

        debug!(%task_id, "Downstream stream ended without terminal event");
        let _ = tx.send(error_frame(task_id, "worker stream ended"));
    }

    /// Pump one subscriber: broadcast frames plus periodic heartbeats.
    async fn run_client(
        &self,
        task_id: Uuid,
        mut frame_rx: broadcast::Receiver<SseFrame>,
        client_tx: mpsc::Sender<SseFrame>,
    ) {
        let connected = Instant::now();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        loop {
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Ok(frame) => {
                        let closing = frame_closes_stream(&frame);
                        if !self.send_to_client(&client_tx, frame).await {
                            debug!(%task_id, "Client writer gone or blocked; dropping client");
                            break;
                        }
                        if closing {
                            // Let the final frame drain before the writer closes.
                            tokio::time::sleep(TERMINAL_DRAIN).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%task_id, skipped, "Client lagging; dropping client");
                        let _ = self
                            .send_to_client(&client_tx, error_frame(task_id, "subscriber lagged behind event stream"))
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    let payload = events::heartbeat_payload(
                        task_id,
                        connected.elapsed().as_millis() as u64,
                        SOURCE_COORDINATOR,
                    );
                    let frame = SseFrame {
                        event: Some(events::event_names::HEARTBEAT.to_string()),
                        data: payload.to_string(),
                        id: None,
                    };
                    if !self.send_to_client(&client_tx, frame).await {
                        break;
                    }
                }
            }
        }
    }

    /// Write one frame to a client with the configured deadline. A client
    /// that cannot take the frame in time is reported dead; siblings are
    /// unaffected because each has its own channel.
    async fn send_to_client(&self, client_tx: &mpsc::Sender<SseFrame>, frame: SseFrame) -> bool {
        tokio::time::timeout(self.write_deadline, client_tx.send(frame))
            .await
            .map(|sent| sent.is_ok())
            .unwrap_or(false)
    }

    async fn remove_client(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&task_id) {
            entry.clients = entry.clients.saturating_sub(1);
            if entry.clients == 0 {
                // Last subscriber gone: the downstream has no audience left.
                entry.downstream.abort();
                entries.remove(&task_id);
                debug!(%task_id, "Last client left; downstream closed");
            }
        }
    }

    /// Discard the per-task entry after the drain and grace windows.
    fn schedule_close(self: &Arc<Self>, task_id: Uuid) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_DRAIN + ENTRY_GRACE).await;
            let mut entries = relay.entries.lock().await;
            if let Some(entry) = entries.remove(&task_id) {
                entry.downstream.abort();
            }
        });
    }

    /// Close a task's stream after the manager reconciled it through the
    /// polling fallback: subscribers get one synthesized terminal frame.
    pub async fn finish_task(self: &Arc<Self>, task_id: Uuid, status: TaskStatus, error: Option<&str>) {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(&task_id) else {
            return;
        };
        let frame = synthesized_terminal_frame(task_id, status, error);
        let _ = entry.tx.send(frame);
        drop(entries);
        self.schedule_close(task_id);
    }

    /// Notify every subscriber that the coordinator is going away, then drop
    /// all entries.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            let frame = SseFrame {
                event: Some(events::event_names::SERVER_SHUTDOWN.to_string()),
                data: events::server_shutdown_payload("coordinator shutting down").to_string(),
                id: None,
            };
            let _ = entry.tx.send(frame);
            entry.downstream.abort();
        }
        if count > 0 {
            info!(streams = count, "Notified SSE subscribers of shutdown");
        }
    }

    #[cfg(test)]
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub async fn client_count(&self, task_id: Uuid) -> usize {
        self.entries
            .lock()
            .await
            .get(&task_id)
            .map(|entry| entry.clients)
            .unwrap_or(0)
    }
}

fn error_frame(task_id: Uuid, message: &str) -> SseFrame {
    SseFrame {
        event: Some(events::event_names::ERROR.to_string()),
        data: events::error_payload(task_id, message).to_string(),
        id: None,
    }
}

/// Whether forwarding this frame should end the client stream
fn frame_closes_stream(frame: &SseFrame) -> bool {
    match frame.event.as_deref() {
        Some(events::event_names::COMPLETE) | Some(events::event_names::FAILED) => true,
        Some(events::event_names::SERVER_SHUTDOWN) => true,
        Some(events::event_names::STATUS) => frame_status(frame)
            .map(|status| status.is_terminal())
            .unwrap_or(false),
        _ => false,
    }
}

fn frame_status(frame: &SseFrame) -> Option<TaskStatus> {
    let value: serde_json::Value = serde_json::from_str(&frame.data).ok()?;
    serde_json::from_value(value.get("status")?.clone()).ok()
}

/// Extract a terminal observation from a worker frame, if it carries one.
fn terminal_notice_from_frame(task_id: Uuid, frame: &SseFrame) -> Option<TerminalNotice> {
    let payload: serde_json::Value = serde_json::from_str(&frame.data).ok()?;
    match frame.event.as_deref() {
        Some(events::event_names::COMPLETE) => {
            let result = payload.get("result");
            Some(TerminalNotice {
                task_id,
                status: TaskStatus::Completed,
                output: result
                    .and_then(|r| r.get("output"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                error: None,
                duration_ms: result
                    .and_then(|r| r.get("metrics"))
                    .and_then(|m| m.get("duration_ms"))
                    .and_then(|v| v.as_u64()),
            })
        }
        Some(events::event_names::FAILED) => Some(TerminalNotice {
            task_id,
            status: TaskStatus::Failed,
            output: None,
            error: payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            duration_ms: None,
        }),
        Some(events::event_names::STATUS) => {
            let status: TaskStatus = serde_json::from_value(payload.get("status")?.clone()).ok()?;
            status.is_terminal().then_some(TerminalNotice {
                task_id,
                status,
                output: None,
                error: None,
                duration_ms: None,
            })
        }
        _ => None,
    }
}

fn synthesized_terminal_frame(task_id: Uuid, status: TaskStatus, error: Option<&str>) -> SseFrame {
    let (event, mut payload) = match status {
        TaskStatus::Completed => (
            events::event_names::COMPLETE,
            serde_json::json!({ "taskId": task_id, "status": status }),
        ),
        TaskStatus::Cancelled => (
            events::event_names::STATUS,
            serde_json::json!({ "taskId": task_id, "status": status }),
        ),
        _ => (
            events::event_names::FAILED,
            serde_json::json!({
                "taskId": task_id,
                "status": status,
                "error": error.unwrap_or("task failed"),
                "retryable": false,
            }),
        ),
    };
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
        object.insert("source".to_string(), serde_json::json!(SOURCE_COORDINATOR));
    }
    SseFrame {
        event: Some(event.to_string()),
        data: payload.to_string(),
        id: None,
    }
}
