//! End-to-end tests of the engine + event bus pipeline: a submitted task
//! must produce a well-ordered event stream and release its executor on
//! every termination path.

use crate::engine::TaskExecutionEngine;
use crate::events::EventBus;
use crate::provider::ProcessPoolProvider;
use crate::unified::UnifiedProvider;
use shared::api::RunTaskRequest;
use shared::config::ProcessPoolConfig;
use shared::events::TaskEvent;
use shared::task::{ExecutionMode, TaskStatus};
use std::sync::Arc;
use std::time::Duration;

fn build_engine() -> (Arc<TaskExecutionEngine>, Arc<EventBus>, Arc<UnifiedProvider>) {
    let pool = ProcessPoolProvider::new(ProcessPoolConfig {
        command: "sh".to_string(),
        min: 0,
        max: 2,
        idle_silence_ms: 300,
        acquire_timeout_ms: 2_000,
        workspace_dir: std::env::temp_dir().display().to_string(),
        ..Default::default()
    });
    let provider =
        Arc::new(UnifiedProvider::new(Some(pool), None, ExecutionMode::ProcessPool, true).unwrap());
    let events = Arc::new(EventBus::new(64));
    let engine = Arc::new(TaskExecutionEngine::new(
        Arc::clone(&provider),
        Arc::clone(&events),
        2,
        60_000,
    ));
    (engine, events, provider)
}

fn run_request(prompt: &str) -> RunTaskRequest {
    RunTaskRequest {
        task_id: None,
        prompt: prompt.to_string(),
        priority: Some(5),
        metadata: None,
        timeout_ms: None,
        mode: None,
        repo_url: None,
    }
}

#[tokio::test]
async fn test_event_stream_is_ordered_and_terminal() {
    let (engine, events, _provider) = build_engine();
    let response = engine
        .submit(run_request("echo stream-marker"))
        .await
        .unwrap();
    let mut subscription = events.subscribe(response.task_id).await.unwrap();

    let mut progress_output = String::new();
    let mut terminal = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

    while terminal.is_none() {
        let event = tokio::time::timeout_at(deadline, subscription.receiver.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed early");
        match event {
            TaskEvent::Status { status } => {
                if status == TaskStatus::Running {
                    // Running must precede any progress output
                    assert!(progress_output.is_empty());
                }
            }
            TaskEvent::Progress { message, .. } => {
                progress_output.push_str(&message);
            }
            TaskEvent::Complete { result } => terminal = Some(*result),
            TaskEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    let result = terminal.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.output.contains("stream-marker"));
    assert!(progress_output.contains("stream-marker"));
    assert!(result.session_id.is_some());
    assert!(result.ended_at >= result.started_at);

    engine.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_executor_released_after_each_terminal() {
    let (engine, _events, provider) = build_engine();

    for prompt in ["echo one", "echo two"] {
        let response = engine.submit(run_request(prompt)).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let status = engine.status(response.task_id).await.unwrap();
            if status.status.is_terminal() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // After each terminal the provider holds no lent-out executors
        let stats = &provider.stats().await[0];
        assert_eq!(stats.active, 0);
    }

    let stats = &provider.stats().await[0];
    assert_eq!(stats.tasks_completed, 2);
    engine.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_two_subscribers_see_same_events_in_order() {
    let (engine, events, _provider) = build_engine();
    let response = engine
        .submit(run_request("echo fanout-marker"))
        .await
        .unwrap();

    let mut first = events.subscribe(response.task_id).await.unwrap();
    let mut second = events.subscribe(response.task_id).await.unwrap();

    let collect = |mut sub: crate::events::Subscription| async move {
        let mut names = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(15), sub.receiver.recv()).await {
                Ok(Ok(event)) => {
                    let terminal = event.is_terminal();
                    names.push(event.name().to_string());
                    if terminal {
                        break;
                    }
                }
                _ => break,
            }
        }
        names
    };

    // Replay handles are unused here; both receivers were attached before
    // any event was published.
    first.replay_terminal = None;
    second.replay_terminal = None;
    let (first_names, second_names) = tokio::join!(collect(first), collect(second));
    assert_eq!(first_names, second_names);
    assert_eq!(first_names.last().map(String::as_str), Some("complete"));

    engine.shutdown(Duration::from_millis(100)).await;
}
