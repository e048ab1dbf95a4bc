//! Execution providers: pools and factories for executors of one mode
//!
//! The process-pool provider maintains a bounded set of reusable pty-backed
//! executors; the container provider creates a fresh one-shot executor per
//! task. Both expose the same acquire/release/cleanup/stats surface and are
//! routed behind the unified provider.

use bollard::container::{RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;
use serde::Serialize;
use shared::config::{ContainerConfig, ProcessPoolConfig};
use shared::task::{ExecutionMode, Task};
use shared::ClusterError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::ContainerExecutor;
use crate::executor::Executor;
use crate::process::ProcessExecutor;

/// Number of recent task durations kept for the rolling average
const DURATION_WINDOW: usize = 100;

/// Point-in-time snapshot of one provider's bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub mode: ExecutionMode,
    /// Executors currently lent out
    pub active: usize,
    /// Warm executors awaiting reuse (always 0 for the container provider)
    pub idle: usize,
    pub total_created: u64,
    pub tasks_completed: u64,
    /// Rolling average over the last 100 completions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_task_duration_ms: Option<u64>,
    /// Aggregate memory ceiling of active executors, when enforced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

fn rolling_average(durations: &VecDeque<u64>) -> Option<u64> {
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<u64>() / durations.len() as u64)
}

fn record_duration(durations: &mut VecDeque<u64>, duration_ms: u64) {
    durations.push_back(duration_ms);
    if durations.len() > DURATION_WINDOW {
        durations.pop_front();
    }
}

// ---------------------------------------------------------------------------
// Process pool
// ---------------------------------------------------------------------------

struct IdleExecutor {
    executor: ProcessExecutor,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleExecutor>,
    active: HashSet<Uuid>,
    /// Slots claimed by in-progress spawns, counted against `max`
    reserved: usize,
    total_created: u64,
    tasks_completed: u64,
    durations: VecDeque<u64>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.reserved
    }
}

/// Bounded pool of reusable process-backed executors.
pub struct ProcessPoolProvider {
    config: ProcessPoolConfig,
    state: Mutex<PoolState>,
    slot_freed: Notify,
    shutting_down: AtomicBool,
}

impl ProcessPoolProvider {
    pub fn new(config: ProcessPoolConfig) -> Self {
        ProcessPoolProvider {
            config,
            state: Mutex::new(PoolState::default()),
            slot_freed: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::ProcessPool
    }

    /// Pre-spawn the configured minimum of warm executors.
    pub async fn warm_up(&self) {
        for _ in 0..self.config.min {
            match self.spawn_executor().await {
                Ok(executor) => {
                    let mut state = self.state.lock().await;
                    state.total_created += 1;
                    state.idle.push(IdleExecutor {
                        executor,
                        idle_since: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to pre-warm process executor");
                    break;
                }
            }
        }
        let state = self.state.lock().await;
        info!(warm = state.idle.len(), "Process pool warmed up");
    }

    async fn spawn_executor(&self) -> Result<ProcessExecutor, ClusterError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || ProcessExecutor::spawn(&config))
            .await
            .map_err(|e| ClusterError::Internal(format!("spawn task panicked: {}", e)))?
    }

    /// Lend out an idle executor, creating one when below the cap. Waits a
    /// bounded time for a slot when the pool is exhausted.
    pub async fn acquire(&self, _task: &Task) -> Result<Executor, ClusterError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClusterError::Executor {
                message: "process pool is shutting down".to_string(),
                retryable: false,
            });
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        loop {
            let mut stale = Vec::new();
            let mut should_spawn = false;
            {
                let mut state = self.state.lock().await;
                while let Some(candidate) = state.idle.pop() {
                    if candidate.executor.is_healthy() {
                        let id = candidate.executor.id();
                        state.active.insert(id);
                        // Terminate any unhealthy executors we skipped over.
                        drop(state);
                        self.discard(stale).await;
                        return Ok(Executor::Process(candidate.executor));
                    }
                    stale.push(candidate.executor);
                }
                if state.total() < self.config.max {
                    state.reserved += 1;
                    should_spawn = true;
                }
            }
            self.discard(stale).await;

            if should_spawn {
                let spawned = self.spawn_executor().await;
                let mut state = self.state.lock().await;
                state.reserved -= 1;
                return match spawned {
                    Ok(executor) => {
                        state.total_created += 1;
                        state.active.insert(executor.id());
                        Ok(Executor::Process(executor))
                    }
                    Err(e) => Err(e),
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClusterError::Executor {
                    message: format!(
                        "process pool exhausted ({} executors busy)",
                        self.config.max
                    ),
                    retryable: true,
                });
            }
            let _ = tokio::time::timeout(remaining, self.slot_freed.notified()).await;
        }
    }

    async fn discard(&self, executors: Vec<ProcessExecutor>) {
        for mut executor in executors {
            debug!(executor_id = %executor.id(), "Discarding unhealthy pooled executor");
            if let Err(e) = executor.terminate().await {
                warn!(executor_id = %executor.id(), error = %e, "Failed to terminate stale executor");
            }
        }
    }

    /// Return an executor to the pool, or terminate it when it is no longer
    /// reusable.
    pub async fn release(&self, executor: Executor) {
        let Executor::Process(executor) = executor else {
            warn!("Process pool asked to release a non-process executor");
            return;
        };
        let reusable = {
            let mut state = self.state.lock().await;
            state.active.remove(&executor.id());
            if let Some(duration_ms) = executor.last_task_duration_ms() {
                state.tasks_completed += 1;
                record_duration(&mut state.durations, duration_ms);
            }
            let reusable = executor.is_healthy() && !self.shutting_down.load(Ordering::SeqCst);
            if reusable {
                state.idle.push(IdleExecutor {
                    executor,
                    idle_since: Instant::now(),
                });
                None
            } else {
                Some(executor)
            }
        };
        if let Some(mut executor) = reusable {
            if let Err(e) = executor.terminate().await {
                warn!(executor_id = %executor.id(), error = %e, "Failed to terminate released executor");
            }
        }
        self.slot_freed.notify_one();
    }

    /// Terminate executors idle past the configured lifetime, keeping the
    /// pool at or above its minimum size.
    pub async fn reap_idle(&self) {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let reaped = {
            let mut state = self.state.lock().await;
            let min = self.config.min;
            let mut keep = Vec::new();
            let mut reap = Vec::new();
            // Oldest first so the freshest executors survive.
            state.idle.sort_by_key(|e| e.idle_since);
            let total_before = state.total();
            let mut remaining = total_before;
            for candidate in state.idle.drain(..) {
                if candidate.idle_since.elapsed() >= idle_timeout && remaining > min {
                    remaining -= 1;
                    reap.push(candidate.executor);
                } else {
                    keep.push(candidate);
                }
            }
            state.idle = keep;
            reap
        };
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reaping idle process executors");
            self.discard(reaped).await;
        }
    }

    /// Terminate every pooled executor. Active executors are terminated as
    /// they come back through `release`. Idempotent.
    pub async fn cleanup(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let idle = {
            let mut state = self.state.lock().await;
            state.idle.drain(..).map(|e| e.executor).collect::<Vec<_>>()
        };
        self.discard(idle).await;
    }

    pub fn is_healthy(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> ProviderStats {
        let state = self.state.lock().await;
        ProviderStats {
            mode: ExecutionMode::ProcessPool,
            active: state.active.len(),
            idle: state.idle.len(),
            total_created: state.total_created,
            tasks_completed: state.tasks_completed,
            avg_task_duration_ms: rolling_average(&state.durations),
            memory_limit_bytes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Container provider
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ContainerState {
    /// Executor id to container id, for orphan cleanup at shutdown
    active: HashMap<Uuid, String>,
    total_created: u64,
    tasks_completed: u64,
    durations: VecDeque<u64>,
}

/// Factory for one-shot container executors: every acquire creates a fresh
/// container, every release destroys it.
pub struct ContainerProvider {
    config: ContainerConfig,
    docker: Docker,
    state: Mutex<ContainerState>,
    shutting_down: AtomicBool,
    healthy: AtomicBool,
}

impl ContainerProvider {
    pub fn new(config: ContainerConfig) -> Result<Self, ClusterError> {
        // Connecting is lazy; daemon reachability is verified per-acquire so
        // a stopped daemon degrades into retryable acquire failures.
        let docker = Docker::connect_with_local_defaults().map_err(|e| ClusterError::Executor {
            message: format!("docker connection setup failed: {}", e),
            retryable: true,
        })?;
        Ok(ContainerProvider {
            config,
            docker,
            state: Mutex::new(ContainerState::default()),
            shutting_down: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::ContainerAgentic
    }

    pub async fn acquire(&self, task: &Task) -> Result<Executor, ClusterError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClusterError::Executor {
                message: "container provider is shutting down".to_string(),
                retryable: false,
            });
        }

        if let Err(e) = self.docker.ping().await {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(ClusterError::Executor {
                message: format!("docker daemon unreachable: {}", e),
                retryable: true,
            });
        }
        self.healthy.store(true, Ordering::SeqCst);

        let executor =
            ContainerExecutor::create(self.docker.clone(), self.config.clone(), task).await?;
        let mut state = self.state.lock().await;
        state.total_created += 1;
        state
            .active
            .insert(executor.id(), executor.container_id().to_string());
        Ok(Executor::Container(executor))
    }

    /// One-shot executors are always terminated on release.
    pub async fn release(&self, executor: Executor) {
        let Executor::Container(mut executor) = executor else {
            warn!("Container provider asked to release a non-container executor");
            return;
        };
        {
            let mut state = self.state.lock().await;
            state.active.remove(&executor.id());
            if let Some(duration_ms) = executor.last_task_duration_ms() {
                state.tasks_completed += 1;
                record_duration(&mut state.durations, duration_ms);
            }
        }
        if let Err(e) = executor.terminate().await {
            warn!(executor_id = %executor.id(), error = %e, "Failed to terminate container executor");
        }
    }

    /// Stop and remove every container this provider still knows about.
    /// Termination errors are logged and never block shutdown. Idempotent.
    pub async fn cleanup(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let containers = {
            let mut state = self.state.lock().await;
            state.active.drain().collect::<Vec<_>>()
        };
        for (executor_id, container_id) in containers {
            debug!(%executor_id, %container_id, "Cleaning up task container");
            if let Err(e) = self
                .docker
                .stop_container(&container_id, Some(StopContainerOptions { t: 5 }))
                .await
            {
                debug!(%container_id, error = %e, "Stop during cleanup reported error");
            }
            if let Err(e) = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                debug!(%container_id, error = %e, "Remove during cleanup reported error");
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> ProviderStats {
        let state = self.state.lock().await;
        ProviderStats {
            mode: ExecutionMode::ContainerAgentic,
            active: state.active.len(),
            idle: 0,
            total_created: state.total_created,
            tasks_completed: state.tasks_completed,
            avg_task_duration_ms: rolling_average(&state.durations),
            memory_limit_bytes: Some(
                state.active.len() as u64 * self.config.resource_limits.memory_bytes,
            ),
        }
    }
}
