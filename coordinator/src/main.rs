//! ClaudeCluster Coordinator
//!
//! The coordinator accepts coding-task submissions, routes each task to the
//! least-loaded healthy worker, relays the worker's SSE progress stream to
//! subscribed clients, and tracks task completion in memory.
// This is the main entry point for the coordinator application. It's responsible for:
// - Initializing logging and configuration.
// - Wiring the registry, task manager, and SSE relay together.
// - Running the background loops: health probing, completion reconciliation, GC.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::CoordinatorConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod registry;
mod sse_relay;
mod task_manager;

use registry::WorkerRegistry;
use sse_relay::SseRelay;
use task_manager::{TaskManager, TerminalNotice};

#[cfg(test)]
mod tests;

/// Capacity of the relay-to-reconciler terminal notice channel
const TERMINAL_CHANNEL_CAPACITY: usize = 256;

/// Command-line arguments for the coordinator
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "ClaudeCluster coordinator that routes coding tasks to sandboxed workers", long_about = None)]
struct CliArgs {
    /// Path to the coordinator configuration file (coordinator.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the worker API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the worker endpoints from config file (comma-separated URLs)
    #[arg(long = "worker-endpoints", value_name = "URLS")]
    worker_endpoints: Option<String>,
}

/// The main application structure for the coordinator.
/// It owns the shared registries and the background loop handles.
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    listen_address: SocketAddr,
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskManager>,
    relay: Arc<SseRelay>,
    terminal_rx: Option<tokio::sync::mpsc::Receiver<TerminalNotice>>,
    health_task_handle: Option<JoinHandle<()>>,
    reconcile_task_handle: Option<JoinHandle<()>>,
    gc_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Coordinator {
    /// Creates a new coordinator instance: builds the registry from the
    /// static worker set and wires the task manager and relay together.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let listen_address: SocketAddr = config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!("Invalid listen address '{}': {}", config.listen_address, e)
        })?;

        let registry = Arc::new(
            WorkerRegistry::new(
                &config.worker_endpoints,
                Duration::from_millis(config.health_probe_timeout_ms),
            )
            .context("Failed to initialize worker registry")?,
        );

        let tasks = Arc::new(
            TaskManager::new(
                Arc::clone(&registry),
                Duration::from_millis(config.dispatch_timeout_ms),
                Duration::from_millis(config.status_poll_interval_ms),
                config.api_key.clone(),
                config.public_base_url.clone(),
            )
            .context("Failed to initialize task manager")?,
        );

        let (terminal_tx, terminal_rx) = tokio::sync::mpsc::channel(TERMINAL_CHANNEL_CAPACITY);
        let relay = Arc::new(
            SseRelay::new(
                config.api_key.clone(),
                Duration::from_millis(config.sse_heartbeat_interval_ms),
                config.sse_client_buffer,
                Duration::from_millis(config.sse_write_deadline_ms),
                terminal_tx,
            )
            .context("Failed to initialize SSE relay")?,
        );

        Ok(Coordinator {
            config: Arc::new(config),
            listen_address,
            registry,
            tasks,
            relay,
            terminal_rx: Some(terminal_rx),
            health_task_handle: None,
            reconcile_task_handle: None,
            gc_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the coordinator and runs until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting ClaudeCluster Coordinator");
        info!(
            listen_address = %self.listen_address,
            workers = self.config.worker_endpoints.len(),
            health_check_interval_ms = self.config.health_check_interval_ms,
            "Coordinator configuration loaded"
        );

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Health probe loop: an immediate first round, then periodic.
        let health_registry = Arc::clone(&self.registry);
        let health_interval = Duration::from_millis(self.config.health_check_interval_ms);
        let mut health_shutdown_rx = shutdown_tx.subscribe();
        let health_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(health_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        health_registry.probe_all().await;
                    }
                    _ = health_shutdown_rx.recv() => {
                        info!("Health probe task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.health_task_handle = Some(health_task);

        // Completion reconciliation: terminal notices from the SSE relay,
        // plus the polling fallback for tasks with no open stream.
        let reconcile_tasks = Arc::clone(&self.tasks);
        let reconcile_relay = Arc::clone(&self.relay);
        let mut terminal_rx = self
            .terminal_rx
            .take()
            .context("Coordinator::run called twice")?;
        let poll_interval = Duration::from_millis(self.config.status_poll_interval_ms);
        let mut reconcile_shutdown_rx = shutdown_tx.subscribe();
        let reconcile_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    notice = terminal_rx.recv() => {
                        let Some(notice) = notice else { break };
                        reconcile_tasks.apply_terminal(notice).await;
                    }
                    _ = interval.tick() => {
                        let reconciled = reconcile_tasks.poll_running().await;
                        for task_id in reconciled {
                            let status = reconcile_tasks.get(task_id).await;
                            if let Some(status) = status {
                                reconcile_relay
                                    .finish_task(task_id, status.status, status.error.as_deref())
                                    .await;
                            }
                        }
                    }
                    _ = reconcile_shutdown_rx.recv() => {
                        info!("Reconciliation task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.reconcile_task_handle = Some(reconcile_task);

        // Periodic GC of terminal tasks
        let gc_tasks = Arc::clone(&self.tasks);
        let gc_interval = Duration::from_millis(self.config.task_gc_interval_ms);
        let gc_max_age = Duration::from_millis(self.config.task_gc_max_age_ms);
        let mut gc_shutdown_rx = shutdown_tx.subscribe();
        let gc_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gc_tasks.gc_sweep(gc_max_age).await;
                    }
                    _ = gc_shutdown_rx.recv() => {
                        info!("GC task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.gc_task_handle = Some(gc_task);

        let state = api::AppState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.tasks),
            Arc::clone(&self.relay),
        );
        let app = api::create_router(state);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Performs a graceful shutdown of the coordinator.
    ///
    /// Shutdown sequence:
    /// 1. Notify SSE subscribers and close their streams.
    /// 2. Broadcast shutdown to background loops and the HTTP server.
    /// 3. Join each background task with a bounded timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down ClaudeCluster Coordinator gracefully");

        self.relay.shutdown().await;

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        let shutdown_timeout = Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);
        for (name, handle) in [
            ("health probe", self.health_task_handle.take()),
            ("reconciliation", self.reconcile_task_handle.take()),
            ("gc", self.gc_task_handle.take()),
        ] {
            if let Some(handle) = handle {
                match tokio::time::timeout(shutdown_timeout, handle).await {
                    Ok(Ok(())) => info!("{} task completed", name),
                    Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                    Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
                }
            }
        }

        info!("Coordinator shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Coordinator entry point
///
/// Initializes logging, loads configuration, applies CLI overrides, and runs
/// until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "coordinator.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coordinator=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("ClaudeCluster Coordinator starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut config = match CoordinatorConfig::load(&cli_args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load coordinator configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides and persist them when anything changed.
    let mut changed = false;
    if let Some(listen_address) = cli_args.listen_address {
        changed |= config.listen_address != listen_address;
        config.listen_address = listen_address;
    }
    if let Some(api_key) = cli_args.api_key {
        changed |= config.api_key.as_deref() != Some(api_key.as_str());
        config.api_key = Some(api_key);
    }
    if let Some(worker_endpoints) = cli_args.worker_endpoints {
        let endpoints: Vec<String> = worker_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        changed |= config.worker_endpoints != endpoints;
        config.worker_endpoints = endpoints;
    }
    if changed {
        if let Err(e) = config.validate().and_then(|_| config.save(&cli_args.config_file)) {
            error!("Failed to apply configuration overrides: {}", e);
            std::process::exit(1);
        }
        info!("Configuration overrides applied and persisted to disk");
    }

    let mut coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Failed to initialize coordinator: {}", e);
            std::process::exit(1);
        }
    };

    // Run the coordinator and the shutdown signal handler concurrently.
    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!("Coordinator error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    coordinator.shutdown().await;
    info!("Coordinator shutdown complete");
    Ok(())
}
