//! Worker registry: the coordinator's view of its static worker set
//!
//! The worker set is fixed at startup from configuration. A periodic health
//! probe refreshes each worker's observed status and load; task dispatch and
//! completion callbacks keep the active-task counters current between
//! probes. Selection picks the least-loaded selectable worker, breaking ties
//! by insertion order.

use chrono::{DateTime, Utc};
use shared::api::{WorkerHealthResponse, WorkerSnapshot, WorkerStatus};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One worker as observed by the coordinator
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Worker id; seeded from position, replaced by the worker's
    /// self-reported id on the first successful probe
    pub id: String,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub active_tasks: u32,
    pub max_tasks: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub uptime_ms: Option<u64>,
}

impl WorkerRecord {
    fn new(index: usize, endpoint: String) -> Self {
        WorkerRecord {
            id: format!("worker-{}", index + 1),
            endpoint,
            // Unknown until the first probe round completes
            status: WorkerStatus::Offline,
            active_tasks: 0,
            max_tasks: 0,
            last_health_check: None,
            capabilities: Vec::new(),
            version: None,
            uptime_ms: None,
        }
    }

    /// Whether this worker can take one more task right now
    fn is_selectable(&self) -> bool {
        match self.status {
            WorkerStatus::Available => true,
            WorkerStatus::Busy => self.active_tasks < self.max_tasks,
            WorkerStatus::Offline | WorkerStatus::Error => false,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status,
            active_tasks: self.active_tasks,
            max_tasks: self.max_tasks,
            last_health_check: self.last_health_check,
            capabilities: self.capabilities.clone(),
            version: self.version.clone(),
            uptime_ms: self.uptime_ms,
        }
    }
}

/// A selected worker, handed to the task manager for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedWorker {
    pub id: String,
    pub endpoint: String,
}

/// Aggregate counts for the health endpoint
#[derive(Debug, Clone, Copy)]
pub struct RegistryCounts {
    pub total: usize,
    pub available: usize,
    pub offline: usize,
    pub total_active_tasks: u32,
}

pub struct WorkerRegistry {
    /// Insertion order is load-bearing: selection ties break on it
    workers: Mutex<Vec<WorkerRecord>>,
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(endpoints: &[String], probe_timeout: Duration) -> shared::Result<Self> {
        let workers = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                WorkerRecord::new(index, endpoint.trim_end_matches('/').to_string())
            })
            .collect();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build probe HTTP client: {}", e))?;
        Ok(WorkerRegistry {
            workers: Mutex::new(workers),
            http,
            probe_timeout,
        })
    }

    /// Probe every worker's health endpoint concurrently and fold the
    /// results back into the registry. The lock is never held across the
    /// network calls.
    pub async fn probe_all(&self) {
        let targets: Vec<(usize, String)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .enumerate()
                .map(|(index, record)| (index, record.endpoint.clone()))
                .collect()
        };

        let probes = targets.iter().map(|(index, endpoint)| {
            let index = *index;
            let url = format!("{}/health", endpoint);
            let http = &self.http;
            let timeout = self.probe_timeout;
            async move {
                let probe_once = || async {
                    let response = http.get(&url).timeout(timeout).send().await?;
                    let response = response.error_for_status()?;
                    response.json::<WorkerHealthResponse>().await
                };
                // Transient probe failures get one immediate retry; dispatch
                // never does.
                let outcome = match probe_once().await {
                    Ok(health) => Ok(health),
                    Err(_) => probe_once().await,
                };
                (index, outcome)
            }
        });
        let results = futures_util::future::join_all(probes).await;

        let mut workers = self.workers.lock().await;
        for (index, outcome) in results {
            let Some(record) = workers.get_mut(index) else {
                continue;
            };
            record.last_health_check = Some(Utc::now());
            match outcome {
                Ok(health) => {
                    let was_offline = !matches!(
                        record.status,
                        WorkerStatus::Available | WorkerStatus::Busy
                    );
                    record.id = health.worker_id;
                    record.status = health.status;
                    record.active_tasks = health.active_tasks.min(health.max_tasks);
                    record.max_tasks = health.max_tasks;
                    record.capabilities = health.capabilities;
                    record.version = Some(health.version);
                    record.uptime_ms = Some(health.uptime_ms);
                    if was_offline {
                        info!(
                            worker_id = %record.id,
                            endpoint = %record.endpoint,
                            "Worker is reachable"
                        );
                    }
                }
                Err(e) => {
                    // Only status and last-seen change on failure; the rest
                    // of the record keeps its last observed values.
                    if record.status != WorkerStatus::Offline {
                        warn!(
                            worker_id = %record.id,
                            endpoint = %record.endpoint,
                            error = %e,
                            "Health probe failed, marking worker offline"
                        );
                    }
                    record.status = WorkerStatus::Offline;
                }
            }
        }
    }

    /// Pick a worker for dispatch.
    ///
    /// With `requested` set, only that worker qualifies (and only while
    /// selectable). Otherwise the least-loaded selectable worker wins, ties
    /// resolved by insertion order.
    pub async fn select_worker(&self, requested: Option<&str>) -> Option<SelectedWorker> {
        let workers = self.workers.lock().await;
        if let Some(requested_id) = requested {
            return workers
                .iter()
                .find(|record| record.id == requested_id && record.is_selectable())
                .map(|record| SelectedWorker {
                    id: record.id.clone(),
                    endpoint: record.endpoint.clone(),
                });
        }

        let mut best: Option<&WorkerRecord> = None;
        for record in workers.iter().filter(|record| record.is_selectable()) {
            // Strict comparison keeps the earliest worker on ties.
            let better = match best {
                Some(current) => record.active_tasks < current.active_tasks,
                None => true,
            };
            if better {
                best = Some(record);
            }
        }
        best.map(|record| SelectedWorker {
            id: record.id.clone(),
            endpoint: record.endpoint.clone(),
        })
    }

    /// Called when a task has been dispatched to a worker.
    pub async fn on_dispatch(&self, worker_id: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(record) = workers.iter_mut().find(|record| record.id == worker_id) {
            record.active_tasks = (record.active_tasks + 1).min(record.max_tasks.max(1));
            if record.status == WorkerStatus::Available && record.active_tasks >= record.max_tasks
            {
                record.status = WorkerStatus::Busy;
            }
            debug!(
                worker_id = %record.id,
                active = record.active_tasks,
                "Worker active counter incremented"
            );
        }
    }

    /// Called when a dispatched task reached a terminal state.
    pub async fn on_terminal(&self, worker_id: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(record) = workers.iter_mut().find(|record| record.id == worker_id) {
            record.active_tasks = record.active_tasks.saturating_sub(1);
            if record.status == WorkerStatus::Busy && record.active_tasks < record.max_tasks {
                record.status = WorkerStatus::Available;
            }
            debug!(
                worker_id = %record.id,
                active = record.active_tasks,
                "Worker active counter decremented"
            );
        }
    }

    /// Serializable snapshot of every record
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.lock().await;
        workers.iter().map(WorkerRecord::snapshot).collect()
    }

    pub async fn counts(&self) -> RegistryCounts {
        let workers = self.workers.lock().await;
        RegistryCounts {
            total: workers.len(),
            available: workers
                .iter()
                .filter(|record| record.status == WorkerStatus::Available)
                .count(),
            offline: workers
                .iter()
                .filter(|record| {
                    matches!(record.status, WorkerStatus::Offline | WorkerStatus::Error)
                })
                .count(),
            total_active_tasks: workers.iter().map(|record| record.active_tasks).sum(),
        }
    }

    /// Force a record into a known state. Test scaffolding only.
    #[cfg(test)]
    pub async fn set_state(&self, index: usize, status: WorkerStatus, active: u32, max: u32) {
        let mut workers = self.workers.lock().await;
        let record = &mut workers[index];
        record.status = status;
        record.active_tasks = active;
        record.max_tasks = max;
    }
}
