//! Container-backed executor
//!
//! Creates a fresh container per task, execs the task command inside it,
//! captures the demultiplexed output stream, and collects artifacts from a
//! host-side workspace directory bind-mounted into the container. One-shot:
//! the provider terminates the executor on release.

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use shared::config::ContainerConfig;
use shared::task::{Artifact, ArtifactKind, Task, TaskMetrics, TaskResult};
use shared::ClusterError;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::executor::{invalid_state_error, ExecutorState, ExecutorStatus, ResourceUsage};

/// Grace period in seconds given to the container on stop
const STOP_GRACE_SECONDS: i64 = 5;

pub struct ContainerExecutor {
    id: Uuid,
    state: ExecutorState,
    current_task: Option<Uuid>,
    started_at: chrono::DateTime<Utc>,
    tasks_completed: u64,
    last_activity: chrono::DateTime<Utc>,
    last_duration_ms: Option<u64>,
    docker: Docker,
    config: ContainerConfig,
    container_id: String,
    /// Host-side workspace bind-mounted at /workspace inside the container
    workspace: PathBuf,
}

impl ContainerExecutor {
    /// Create and start a fresh container for one task.
    pub async fn create(
        docker: Docker,
        config: ContainerConfig,
        task: &Task,
    ) -> Result<Self, ClusterError> {
        let id = Uuid::new_v4();
        let workspace = prepare_workspace(&config.workspace_dir, task.id).await?;

        let mut env = vec![format!("CLAUDECLUSTER_TASK_ID={}", task.id)];
        if let Some(repo_url) = &task.repo_url {
            env.push(format!("CLAUDECLUSTER_REPO_URL={}", repo_url));
        }
        if let Some(credential_var) = &config.api_credential_env {
            if let Ok(credential) = std::env::var(credential_var) {
                env.push(format!("{}={}", credential_var, credential));
            }
        }

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/workspace", workspace.display())]),
            memory: Some(config.resource_limits.memory_bytes as i64),
            cpu_shares: config.resource_limits.cpu_shares,
            network_mode: Some(config.network_mode.clone()),
            security_opt: Some(config.security_options.clone()),
            cap_drop: config
                .drop_all_capabilities
                .then(|| vec!["ALL".to_string()]),
            auto_remove: Some(config.auto_remove),
            readonly_rootfs: Some(config.read_only_rootfs),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            user: Some(config.user.clone()),
            working_dir: Some("/workspace".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("claudecluster-{}", task.id);
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(docker_error)?;

        docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_error)?;

        debug!(
            executor_id = %id,
            container_id = %created.id,
            image = %config.image,
            "Started task container"
        );

        Ok(ContainerExecutor {
            id,
            state: ExecutorState::Idle,
            current_task: None,
            started_at: Utc::now(),
            tasks_completed: 0,
            last_activity: Utc::now(),
            last_duration_ms: None,
            docker,
            config,
            container_id: created.id,
            workspace,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Docker container id, used by the provider for orphan cleanup
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Exec the task command inside the container, capture its demuxed
    /// output, wait for exit, and collect workspace artifacts.
    pub async fn execute(
        &mut self,
        task: &Task,
        chunks: mpsc::Sender<String>,
    ) -> Result<TaskResult, ClusterError> {
        if !self.state.can_execute() {
            return Err(invalid_state_error(self.state));
        }
        self.state = ExecutorState::Executing;
        self.current_task = Some(task.id);
        self.last_activity = Utc::now();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut cmd = if self.config.command.is_empty() {
            vec!["claude".to_string(), "-p".to_string()]
        } else {
            self.config.command.clone()
        };
        cmd.push(task.prompt.clone());

        let run = self.run_exec(cmd, &chunks).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.last_duration_ms = Some(duration_ms);
        self.last_activity = Utc::now();
        self.current_task = None;

        let (output, exit_code) = match run {
            Ok(captured) => captured,
            Err(e) => {
                self.state = ExecutorState::Error;
                return Err(e);
            }
        };
        self.tasks_completed += 1;
        // One-shot: the executor is destined for termination on release.
        self.state = ExecutorState::Terminating;

        let artifacts = collect_artifacts(
            self.workspace.clone(),
            self.config.artifact_checksum_max_bytes,
        )
        .await;

        let metrics = TaskMetrics {
            duration_ms,
            memory_bytes: Some(self.config.resource_limits.memory_bytes),
            exit_code,
            ..Default::default()
        };

        let mut result = if exit_code.unwrap_or(0) == 0 {
            TaskResult::completed(output, metrics, started_at)
        } else {
            TaskResult::failed(
                format!("task command exited with code {}", exit_code.unwrap_or(-1)),
                output,
                metrics,
                started_at,
            )
        };
        result.artifacts = artifacts;
        Ok(result)
    }

    async fn run_exec(
        &self,
        cmd: Vec<String>,
        chunks: &mpsc::Sender<String>,
    ) -> Result<(String, Option<i64>), ClusterError> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_error)?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(docker_error)?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(message) = stream.next().await {
                    let log = message.map_err(docker_error)?;
                    let text = String::from_utf8_lossy(&log.into_bytes()).into_owned();
                    output.push_str(&text);
                    let _ = chunks.send(text).await;
                }
            }
            StartExecResults::Detached => {
                return Err(ClusterError::Executor {
                    message: "exec started detached; no output stream".to_string(),
                    retryable: false,
                });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(docker_error)?;
        Ok((output, inspect.exit_code))
    }

    /// Stop and remove the container. Idempotent; not-found errors from the
    /// daemon are swallowed because auto-remove may have beaten us to it.
    pub async fn terminate(&mut self) -> Result<(), ClusterError> {
        if self.state == ExecutorState::Terminated {
            return Ok(());
        }
        self.state = ExecutorState::Terminating;

        if let Err(e) = self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            )
            .await
        {
            debug!(container_id = %self.container_id, error = %e, "Stop container reported error");
        }
        if let Err(e) = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(container_id = %self.container_id, error = %e, "Remove container reported error");
        }

        self.state = ExecutorState::Terminated;
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.state, ExecutorState::Idle | ExecutorState::Executing)
    }

    pub fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            id: self.id,
            mode: shared::task::ExecutionMode::ContainerAgentic,
            state: self.state,
            current_task: self.current_task,
            started_at: self.started_at,
            tasks_completed: self.tasks_completed,
            last_activity: self.last_activity,
            resource_usage: ResourceUsage {
                memory_bytes: Some(self.config.resource_limits.memory_bytes),
                cpu_percent: None,
            },
        }
    }

    pub fn last_task_duration_ms(&self) -> Option<u64> {
        self.last_duration_ms
    }
}

fn docker_error(error: bollard::errors::Error) -> ClusterError {
    // Daemon and transport failures are infrastructure problems a retry on
    // the other provider can dodge; everything surfaced here is treated as
    // transient for failover purposes.
    ClusterError::Executor {
        message: format!("docker: {}", error),
        retryable: true,
    }
}

/// Create the per-task host workspace directory and return its absolute path.
async fn prepare_workspace(root: &str, task_id: Uuid) -> Result<PathBuf, ClusterError> {
    let dir = Path::new(root).join(format!("task-{}", task_id));
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        ClusterError::Executor {
            message: format!("failed to create workspace {}: {}", dir.display(), e),
            retryable: false,
        }
    })?;
    dir.canonicalize().map_err(|e| ClusterError::Executor {
        message: format!("failed to resolve workspace {}: {}", dir.display(), e),
        retryable: false,
    })
}

/// Walk the workspace and record a handle for every regular file, skipping
/// VCS metadata. Checksums are computed only below the configured size cap;
/// content is never inlined.
pub async fn collect_artifacts(workspace: PathBuf, checksum_max_bytes: u64) -> Vec<Artifact> {
    let result = tokio::task::spawn_blocking(move || walk_artifacts(&workspace, checksum_max_bytes))
        .await;
    match result {
        Ok(artifacts) => artifacts,
        Err(e) => {
            warn!(error = %e, "Artifact collection task failed");
            Vec::new()
        }
    }
}

fn walk_artifacts(workspace: &Path, checksum_max_bytes: u64) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    let mut pending = vec![workspace.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read workspace directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = entry.file_name();
            if file_name == ".git" {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let size_bytes = entry.metadata().ok().map(|m| m.len());
                let checksum = match size_bytes {
                    Some(size) if size <= checksum_max_bytes => {
                        shared::utils::calculate_file_checksum(&path).ok()
                    }
                    _ => None,
                };
                artifacts.push(Artifact {
                    name: file_name.to_string_lossy().into_owned(),
                    path: path.display().to_string(),
                    kind: ArtifactKind::File,
                    size_bytes,
                    checksum,
                    created_at: Utc::now(),
                });
            }
        }
    }

    // Stable order keeps results deterministic for equal workspaces.
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_artifact_walk_skips_vcs_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("patch.diff"), b"diff content").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref: main").unwrap();

        let artifacts = collect_artifacts(dir.path().to_path_buf(), 1024 * 1024).await;
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(artifacts.len(), 2);
        assert!(names.contains(&"patch.diff"));
        assert!(names.contains(&"main.rs"));
        assert!(artifacts.iter().all(|a| !a.path.contains(".git")));
    }

    #[tokio::test]
    async fn test_artifact_checksum_respects_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), b"small").unwrap();
        std::fs::write(dir.path().join("large.bin"), vec![0u8; 64]).unwrap();

        // Cap below the large file's size: it gets no checksum
        let artifacts = collect_artifacts(dir.path().to_path_buf(), 16).await;
        let small = artifacts.iter().find(|a| a.name == "small.txt").unwrap();
        let large = artifacts.iter().find(|a| a.name == "large.bin").unwrap();
        assert!(small.checksum.is_some());
        assert!(large.checksum.is_none());
        assert_eq!(large.size_bytes, Some(64));
    }

    #[tokio::test]
    async fn test_artifact_walk_of_missing_dir_is_empty() {
        let artifacts =
            collect_artifacts(PathBuf::from("/nonexistent/claudecluster-test"), 1024).await;
        assert!(artifacts.is_empty());
    }
}
