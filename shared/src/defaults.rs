//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! files that don't specify certain optional fields.

// Coordinator configuration defaults

/// Default coordinator listen address
pub fn default_coordinator_listen_address() -> String {
    "0.0.0.0:7080".to_string()
}

/// Default interval between worker health probes (30 seconds)
pub fn default_health_check_interval_ms() -> u64 {
    30_000
}

/// Default per-request timeout for a single health probe (5 seconds)
pub fn default_health_probe_timeout_ms() -> u64 {
    5_000
}

/// Default timeout for dispatching a task to a worker (10 seconds)
pub fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

/// Default interval between completion-reconciliation polls (5 seconds)
pub fn default_status_poll_interval_ms() -> u64 {
    5_000
}

/// Default interval between task garbage collection sweeps (1 hour)
pub fn default_task_gc_interval_ms() -> u64 {
    3_600_000
}

/// Default retention for terminal tasks before GC (24 hours)
pub fn default_task_gc_max_age_ms() -> u64 {
    86_400_000
}

// SSE defaults (shared by coordinator relay and worker stream endpoint)

/// Default heartbeat interval for SSE subscribers (30 seconds)
pub fn default_sse_heartbeat_interval_ms() -> u64 {
    30_000
}

/// Default per-subscriber event buffer before a lagging client is dropped
pub fn default_sse_client_buffer() -> usize {
    256
}

/// Default deadline for a blocked subscriber write before the client is dropped (10 seconds)
pub fn default_sse_write_deadline_ms() -> u64 {
    10_000
}

// Worker configuration defaults

/// Default worker listen address
pub fn default_worker_listen_address() -> String {
    "0.0.0.0:7081".to_string()
}

/// Default maximum number of concurrently executing tasks per worker
pub fn default_max_concurrent_tasks() -> usize {
    5
}

/// Default upper bound applied to any requested task timeout (10 minutes)
pub fn default_session_timeout_ms() -> u64 {
    600_000
}

/// Default capability set a worker declares in its health response
pub fn default_capabilities() -> Vec<String> {
    vec!["code".to_string()]
}

// Process pool defaults

/// Default minimum number of warm process executors
pub fn default_pool_min() -> usize {
    1
}

/// Default maximum number of process executors
pub fn default_pool_max() -> usize {
    4
}

/// Default idle lifetime before a pooled process executor is reaped (5 minutes)
pub fn default_pool_idle_timeout_ms() -> u64 {
    300_000
}

/// Default hard cap on a single process-backed execution (10 minutes)
pub fn default_process_timeout_ms() -> u64 {
    600_000
}

/// Default silence window after which captured output is considered complete (2 seconds)
pub fn default_idle_silence_ms() -> u64 {
    2_000
}

/// Default wait for a free pool slot before acquisition fails (10 seconds)
pub fn default_pool_acquire_timeout_ms() -> u64 {
    10_000
}

/// Default agent command launched inside a process executor
pub fn default_agent_command() -> String {
    "claude".to_string()
}

/// Default workspace root for task execution
pub fn default_workspace_dir() -> String {
    "./workspace".to_string()
}

/// Default temp directory for process executors
pub fn default_temp_dir() -> String {
    "/tmp".to_string()
}

// Container defaults

/// Default container image for one-shot task execution
pub fn default_container_image() -> String {
    "claudecluster/agent:latest".to_string()
}

/// Default container network mode
pub fn default_network_mode() -> String {
    "bridge".to_string()
}

/// Default container memory limit (2 GiB)
pub fn default_container_memory_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

/// Default container security options
pub fn default_security_options() -> Vec<String> {
    vec!["no-new-privileges:true".to_string()]
}

/// Default non-root user inside task containers
pub fn default_container_user() -> String {
    "1000:1000".to_string()
}

/// Default artifact checksum size cap: files larger than this are recorded
/// without a checksum (1 MiB)
pub fn default_artifact_checksum_max_bytes() -> u64 {
    1024 * 1024
}

// Shutdown defaults

/// Default grace window for in-flight work during shutdown (30 seconds)
pub fn default_shutdown_grace_ms() -> u64 {
    30_000
}

/// Default wait for background tasks to finish during shutdown (30 seconds)
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

/// Helper for serde defaults of `true`
pub fn default_true() -> bool {
    true
}
