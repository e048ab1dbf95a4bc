//! Configuration types and validation for the ClaudeCluster dispatcher
//!
//! This module defines the configuration structures used by both coordinator
//! and worker components, including validation logic and serialization
//! support. Each binary loads its config from a TOML file whose path is the
//! positional CLI argument; command-line overrides are persisted back to the
//! same file.

use crate::defaults::*;
use crate::task::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coordinator configuration loaded from coordinator.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_coordinator_listen_address")]
    pub listen_address: String,
    /// Static set of worker endpoint URLs, probed for health at runtime
    pub worker_endpoints: Vec<String>,
    /// API key attached to worker requests (dispatch, probe, stream)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL advertised to clients in `streamUrl`; defaults to a relative path
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Interval between health probe rounds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Per-request timeout for one health probe
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,
    /// Timeout for the single-shot dispatch POST to a worker
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Interval between completion-reconciliation polls of running tasks
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Interval between task GC sweeps
    #[serde(default = "default_task_gc_interval_ms")]
    pub task_gc_interval_ms: u64,
    /// Age past terminal state after which a task record is dropped
    #[serde(default = "default_task_gc_max_age_ms")]
    pub task_gc_max_age_ms: u64,
    /// Heartbeat interval for SSE subscribers
    #[serde(default = "default_sse_heartbeat_interval_ms")]
    pub sse_heartbeat_interval_ms: u64,
    /// Per-subscriber buffered events before a lagging client is dropped
    #[serde(default = "default_sse_client_buffer")]
    pub sse_client_buffer: usize,
    /// Deadline for a blocked subscriber write before the client is dropped
    #[serde(default = "default_sse_write_deadline_ms")]
    pub sse_write_deadline_ms: u64,
    /// Wait for background tasks to finish during shutdown
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl CoordinatorConfig {
    /// Load and validate a coordinator configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::ClusterError::Validation(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: CoordinatorConfig = toml::from_str(&content).map_err(|e| {
            crate::ClusterError::Validation(format!("Failed to parse coordinator config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration back to disk (used after CLI overrides).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::ClusterError::Validation(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.listen_address.parse::<std::net::SocketAddr>().map_err(|e| {
            crate::ClusterError::Validation(format!(
                "Invalid listen address '{}': {}",
                self.listen_address, e
            ))
        })?;

        if self.worker_endpoints.is_empty() {
            return Err(crate::ClusterError::Validation(
                "worker_endpoints must list at least one worker URL".to_string(),
            )
            .into());
        }
        for endpoint in &self.worker_endpoints {
            crate::utils::validate_url(endpoint)?;
        }
        if let Some(base) = &self.public_base_url {
            crate::utils::validate_url(base)?;
        }

        if self.health_check_interval_ms < 1_000 {
            return Err(crate::ClusterError::Validation(
                "health_check_interval_ms must be at least 1000".to_string(),
            )
            .into());
        }
        if self.health_probe_timeout_ms == 0 || self.dispatch_timeout_ms == 0 {
            return Err(crate::ClusterError::Validation(
                "probe and dispatch timeouts must be non-zero".to_string(),
            )
            .into());
        }
        if self.sse_client_buffer == 0 {
            return Err(crate::ClusterError::Validation(
                "sse_client_buffer must be non-zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Where the worker API key is read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    /// Key inlined in the config file
    #[default]
    Config,
    /// Key read from the `CLAUDECLUSTER_API_KEY` environment variable
    Env,
    /// Key read from a file named by `key_file`
    File,
}

/// Worker authentication settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthConfig {
    /// Pre-shared key clients must present in the `X-Api-Key` header.
    /// When unset (and no other source yields a key), auth is disabled.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub source: AuthSource,
    /// Key file path, used when `source = "file"`
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Environment variable consulted when `source = "env"`
pub const API_KEY_ENV_VAR: &str = "CLAUDECLUSTER_API_KEY";

impl AuthConfig {
    /// Resolve the effective API key from the configured source.
    pub fn resolve_key(&self) -> crate::Result<Option<String>> {
        match self.source {
            AuthSource::Config => Ok(self.api_key.clone()),
            AuthSource::Env => Ok(std::env::var(API_KEY_ENV_VAR).ok().filter(|k| !k.is_empty())),
            AuthSource::File => match &self.key_file {
                Some(path) => {
                    let key = std::fs::read_to_string(path).map_err(|e| {
                        crate::ClusterError::Validation(format!(
                            "Failed to read API key file {}: {}",
                            path, e
                        ))
                    })?;
                    let key = key.trim().to_string();
                    Ok(if key.is_empty() { None } else { Some(key) })
                }
                None => Err(crate::ClusterError::Validation(
                    "auth.source is 'file' but auth.key_file is not set".to_string(),
                )
                .into()),
            },
        }
    }
}

/// Process pool settings for the reusable-executor backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessPoolConfig {
    /// Minimum number of warm executors kept alive
    #[serde(default = "default_pool_min")]
    pub min: usize,
    /// Maximum number of executors, warm or executing
    #[serde(default = "default_pool_max")]
    pub max: usize,
    /// Idle lifetime before a pooled executor is reaped
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Hard cap on a single execution
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
    /// Silence window after which captured output is considered complete
    #[serde(default = "default_idle_silence_ms")]
    pub idle_silence_ms: u64,
    /// Wait for a free pool slot before acquisition fails
    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Agent CLI launched inside each executor
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments passed to the agent CLI
    #[serde(default)]
    pub args: Vec<String>,
    /// Workspace root the agent runs in
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Temp directory exported to the agent process
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Advisory memory cap exported to the agent process, in MB
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        ProcessPoolConfig {
            min: default_pool_min(),
            max: default_pool_max(),
            idle_timeout_ms: default_pool_idle_timeout_ms(),
            process_timeout_ms: default_process_timeout_ms(),
            idle_silence_ms: default_idle_silence_ms(),
            acquire_timeout_ms: default_pool_acquire_timeout_ms(),
            command: default_agent_command(),
            args: Vec::new(),
            workspace_dir: default_workspace_dir(),
            temp_dir: default_temp_dir(),
            max_memory_mb: None,
        }
    }
}

/// Container resource limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Hard memory limit in bytes
    #[serde(default = "default_container_memory_bytes")]
    pub memory_bytes: u64,
    /// Relative CPU shares (Docker default is 1024)
    #[serde(default)]
    pub cpu_shares: Option<i64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            memory_bytes: default_container_memory_bytes(),
            cpu_shares: None,
        }
    }
}

/// Container settings for the one-shot-executor backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    /// Image used for every task container
    #[serde(default = "default_container_image")]
    pub image: String,
    /// Docker network mode
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Additional security options applied to every container
    #[serde(default = "default_security_options")]
    pub security_options: Vec<String>,
    /// Drop all Linux capabilities inside the container
    #[serde(default = "default_true")]
    pub drop_all_capabilities: bool,
    /// Non-root user the task command runs as
    #[serde(default = "default_container_user")]
    pub user: String,
    /// Remove the container after exit
    #[serde(default = "default_true")]
    pub auto_remove: bool,
    /// Mount the root filesystem read-only (the workspace stays writable)
    #[serde(default)]
    pub read_only_rootfs: bool,
    /// Host directory under which per-task workspaces are created and
    /// bind-mounted into the container
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Command template executed inside the container; the task prompt is
    /// appended as the final argument
    #[serde(default)]
    pub command: Vec<String>,
    /// Name of an environment variable whose value is passed through to the
    /// container as the agent API credential
    #[serde(default)]
    pub api_credential_env: Option<String>,
    /// Files larger than this are recorded as artifacts without a checksum
    #[serde(default = "default_artifact_checksum_max_bytes")]
    pub artifact_checksum_max_bytes: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            image: default_container_image(),
            network_mode: default_network_mode(),
            resource_limits: ResourceLimits::default(),
            security_options: default_security_options(),
            drop_all_capabilities: true,
            user: default_container_user(),
            auto_remove: true,
            read_only_rootfs: false,
            workspace_dir: default_workspace_dir(),
            command: Vec::new(),
            api_credential_env: None,
            artifact_checksum_max_bytes: default_artifact_checksum_max_bytes(),
        }
    }
}

/// Feature toggles for the execution provider layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFlags {
    /// Initialize the container provider at startup
    #[serde(default)]
    pub enable_container_mode: bool,
    /// Allow falling back to the other provider on transient acquire failure
    #[serde(default = "default_true")]
    pub allow_mode_override: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            enable_container_mode: false,
            allow_mode_override: true,
        }
    }
}

/// Worker configuration loaded from worker.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_worker_listen_address")]
    pub listen_address: String,
    /// Unique identifier for this worker
    pub worker_id: String,
    /// Human-readable name; defaults to the worker id
    #[serde(default)]
    pub name: Option<String>,
    /// Maximum number of concurrently executing tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Default execution mode for tasks that do not request one
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    /// Upper bound applied to any requested task timeout
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Capability set declared in health responses
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub process_pool: ProcessPoolConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Heartbeat interval for SSE subscribers
    #[serde(default = "default_sse_heartbeat_interval_ms")]
    pub sse_heartbeat_interval_ms: u64,
    /// Per-subscriber buffered events before a lagging client is dropped
    #[serde(default = "default_sse_client_buffer")]
    pub sse_client_buffer: usize,
    /// Deadline for a blocked subscriber write before the client is dropped
    #[serde(default = "default_sse_write_deadline_ms")]
    pub sse_write_deadline_ms: u64,
    /// Grace window given to in-flight tasks during shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::ProcessPool
}

impl WorkerConfig {
    /// Load and validate a worker configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::ClusterError::Validation(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: WorkerConfig = toml::from_str(&content).map_err(|e| {
            crate::ClusterError::Validation(format!("Failed to parse worker config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration back to disk (used after CLI overrides).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::ClusterError::Validation(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Display name used in health responses
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.worker_id)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.listen_address.parse::<std::net::SocketAddr>().map_err(|e| {
            crate::ClusterError::Validation(format!(
                "Invalid listen address '{}': {}",
                self.listen_address, e
            ))
        })?;
        crate::utils::validate_worker_id(&self.worker_id)?;

        if self.max_concurrent_tasks == 0 {
            return Err(crate::ClusterError::Validation(
                "max_concurrent_tasks must be at least 1".to_string(),
            )
            .into());
        }
        if self.session_timeout_ms < crate::task::MIN_TIMEOUT_MS {
            return Err(crate::ClusterError::Validation(format!(
                "session_timeout_ms must be at least {}",
                crate::task::MIN_TIMEOUT_MS
            ))
            .into());
        }

        if self.process_pool.max == 0 || self.process_pool.min > self.process_pool.max {
            return Err(crate::ClusterError::Validation(format!(
                "process pool bounds invalid: min={} max={}",
                self.process_pool.min, self.process_pool.max
            ))
            .into());
        }
        if self.process_pool.command.is_empty() {
            return Err(crate::ClusterError::Validation(
                "process_pool.command must not be empty".to_string(),
            )
            .into());
        }

        if self.execution_mode == ExecutionMode::ContainerAgentic
            && !self.feature_flags.enable_container_mode
        {
            return Err(crate::ClusterError::Validation(
                "execution_mode is 'container_agentic' but feature_flags.enable_container_mode is false"
                    .to_string(),
            )
            .into());
        }
        if self.feature_flags.enable_container_mode && self.container.image.is_empty() {
            return Err(crate::ClusterError::Validation(
                "container.image must not be empty when container mode is enabled".to_string(),
            )
            .into());
        }

        if self.auth.source == AuthSource::File && self.auth.key_file.is_none() {
            return Err(crate::ClusterError::Validation(
                "auth.source is 'file' but auth.key_file is not set".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn coordinator_toml() -> &'static str {
        r#"
listen_address = "127.0.0.1:7080"
worker_endpoints = ["http://w1:7081", "http://w2:7081"]
"#
    }

    #[test]
    fn test_coordinator_config_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", coordinator_toml()).unwrap();
        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.health_check_interval_ms, 30_000);
        assert_eq!(config.task_gc_max_age_ms, 86_400_000);
        assert_eq!(config.worker_endpoints.len(), 2);
    }

    #[test]
    fn test_coordinator_config_rejects_empty_workers() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_address = \"127.0.0.1:7080\"\nworker_endpoints = []\n"
        )
        .unwrap();
        assert!(CoordinatorConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_coordinator_config_rejects_bad_endpoint() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_address = \"127.0.0.1:7080\"\nworker_endpoints = [\"ftp://w1\"]\n"
        )
        .unwrap();
        assert!(CoordinatorConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_worker_config_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "worker_id = \"w1\"\n").unwrap();
        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.execution_mode, ExecutionMode::ProcessPool);
        assert_eq!(config.process_pool.max, 4);
        assert!(config.feature_flags.allow_mode_override);
        assert!(!config.feature_flags.enable_container_mode);
        assert_eq!(config.display_name(), "w1");
    }

    #[test]
    fn test_worker_config_container_mode_requires_flag() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "worker_id = \"w1\"\nexecution_mode = \"container_agentic\"\n"
        )
        .unwrap();
        assert!(WorkerConfig::load(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "worker_id = \"w1\"\nexecution_mode = \"container_agentic\"\n\n[feature_flags]\nenable_container_mode = true\n"
        )
        .unwrap();
        assert!(WorkerConfig::load(file.path()).is_ok());
    }

    #[test]
    fn test_worker_config_save_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "worker_id = \"w1\"\n").unwrap();
        let mut config = WorkerConfig::load(file.path()).unwrap();
        config.max_concurrent_tasks = 9;
        config.save(file.path()).unwrap();
        let reloaded = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_auth_key_resolution_from_file() {
        let mut key_file = NamedTempFile::new().unwrap();
        write!(key_file, "secret-key\n").unwrap();
        let auth = AuthConfig {
            api_key: None,
            source: AuthSource::File,
            key_file: Some(key_file.path().display().to_string()),
        };
        assert_eq!(auth.resolve_key().unwrap().as_deref(), Some("secret-key"));
    }

    #[test]
    fn test_auth_defaults_to_disabled() {
        let auth = AuthConfig::default();
        assert_eq!(auth.resolve_key().unwrap(), None);
    }
}
