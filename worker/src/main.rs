//! ClaudeCluster Worker
//!
//! The worker hosts executors and runs coding tasks on behalf of the
//! coordinator. It exposes an HTTP surface for task submission, status,
//! cancellation, and SSE progress streaming, and executes each task inside
//! either a pooled agent process or a one-shot container.
// This is the main entry point for the worker application. It's responsible for:
// - Initializing logging and configuration.
// - Wiring the execution providers, event bus, and engine together.
// - Starting the web server and API endpoints.
// - Handling graceful shutdown with a grace window for in-flight tasks.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::WorkerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod container;
mod engine;
mod events;
mod executor;
mod process;
mod provider;
mod session;
mod unified;

use engine::TaskExecutionEngine;
use events::EventBus;
use provider::{ContainerProvider, ProcessPoolProvider};
use unified::UnifiedProvider;

#[cfg(test)]
mod tests;

/// Interval between idle-executor reap passes
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Interval between task record GC sweeps
const GC_INTERVAL: Duration = Duration::from_secs(3600);
/// Age past terminal state after which task records are swept
const GC_MAX_AGE: Duration = Duration::from_secs(86_400);

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "ClaudeCluster worker that executes coding tasks in sandboxed agents", long_about = None)]
struct CliArgs {
    /// Path to the worker configuration file (worker.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the worker ID from config file
    #[arg(long = "worker-id", value_name = "ID")]
    worker_id: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the maximum concurrent tasks from config file
    #[arg(long = "max-concurrent-tasks", value_name = "COUNT")]
    max_concurrent_tasks: Option<usize>,
}

/// The main application structure for the worker.
/// It wires the providers, event bus, and engine together and owns the
/// background maintenance tasks.
pub struct Worker {
    config: Arc<WorkerConfig>,
    listen_address: SocketAddr,
    engine: Arc<TaskExecutionEngine>,
    provider: Arc<UnifiedProvider>,
    events: Arc<EventBus>,
    reap_task_handle: Option<JoinHandle<()>>,
    gc_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Worker {
    /// Creates and fully initializes a new worker instance: loads config,
    /// initializes the execution providers, and builds the engine.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let listen_address: SocketAddr = config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!("Invalid listen address '{}': {}", config.listen_address, e)
        })?;

        // The workspace root must exist before executors start in it.
        std::fs::create_dir_all(&config.process_pool.workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory {}",
                config.process_pool.workspace_dir
            )
        })?;

        let process_provider = Some(ProcessPoolProvider::new(config.process_pool.clone()));
        let container_provider = if config.feature_flags.enable_container_mode {
            match ContainerProvider::new(config.container.clone()) {
                Ok(provider) => {
                    info!(image = %config.container.image, "Container provider initialized");
                    Some(provider)
                }
                Err(e) => {
                    // A missing daemon degrades to process-pool-only service
                    // rather than failing startup.
                    warn!(error = %e, "Container provider unavailable");
                    None
                }
            }
        } else {
            None
        };

        let provider = Arc::new(
            UnifiedProvider::new(
                process_provider,
                container_provider,
                config.execution_mode,
                config.feature_flags.allow_mode_override,
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize providers: {}", e))?,
        );

        let events = Arc::new(EventBus::new(config.sse_client_buffer));
        let engine = Arc::new(TaskExecutionEngine::new(
            Arc::clone(&provider),
            Arc::clone(&events),
            config.max_concurrent_tasks,
            config.session_timeout_ms,
        ));

        Ok(Worker {
            config: Arc::new(config),
            listen_address,
            engine,
            provider,
            events,
            reap_task_handle: None,
            gc_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the worker and runs until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting ClaudeCluster Worker");
        info!(
            worker_id = %self.config.worker_id,
            listen_address = %self.listen_address,
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            execution_mode = %self.config.execution_mode,
            "Worker configuration loaded"
        );

        self.provider.warm_up().await;

        // Create shutdown broadcast channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Periodic reaper for idle pooled executors
        let reap_provider = Arc::clone(&self.provider);
        let mut reap_shutdown_rx = shutdown_tx.subscribe();
        let reap_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        reap_provider.reap_idle().await;
                    }
                    _ = reap_shutdown_rx.recv() => {
                        info!("Reaper task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.reap_task_handle = Some(reap_task);

        // Periodic GC of terminal task records
        let gc_engine = Arc::clone(&self.engine);
        let mut gc_shutdown_rx = shutdown_tx.subscribe();
        let gc_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gc_engine.gc(GC_MAX_AGE).await;
                    }
                    _ = gc_shutdown_rx.recv() => {
                        info!("GC task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.gc_task_handle = Some(gc_task);

        let api_key = self
            .config
            .auth
            .resolve_key()
            .context("Failed to resolve worker API key")?;
        if api_key.is_some() {
            info!("API key authentication enabled");
        } else {
            info!("API key authentication disabled");
        }

        let state = api::AppState::new(
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
            Arc::clone(&self.events),
            api_key,
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

    /// Performs a graceful shutdown of the worker.
    ///
    /// Shutdown sequence:
    /// 1. Broadcast shutdown to background tasks and the HTTP server.
    /// 2. Stop intake and give in-flight tasks the configured grace window.
    /// 3. Cancel surviving sessions and clean up both providers.
    pub async fn shutdown(&mut self) {
        info!("Shutting down ClaudeCluster Worker gracefully");

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        self.engine
            .shutdown(Duration::from_millis(self.config.shutdown_grace_ms))
            .await;

        for (name, handle) in [
            ("reaper", self.reap_task_handle.take()),
            ("gc", self.gc_task_handle.take()),
        ] {
            if let Some(handle) = handle {
                match tokio::time::timeout(Duration::from_secs(5), handle).await {
                    Ok(Ok(())) => info!("{} task completed", name),
                    Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                    Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
                }
            }
        }

        info!("Worker shutdown complete");
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

/// Worker entry point
///
/// Initializes logging, loads configuration, applies CLI overrides, and runs
/// until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("ClaudeCluster Worker starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut config = match WorkerConfig::load(&cli_args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load worker configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply command-line overrides and persist them when anything changed.
    let mut changed = false;
    if let Some(listen_address) = cli_args.listen_address {
        changed |= config.listen_address != listen_address;
        config.listen_address = listen_address;
    }
    if let Some(worker_id) = cli_args.worker_id {
        changed |= config.worker_id != worker_id;
        config.worker_id = worker_id;
    }
    if let Some(api_key) = cli_args.api_key {
        changed |= config.auth.api_key.as_deref() != Some(api_key.as_str());
        config.auth.api_key = Some(api_key);
        config.auth.source = shared::config::AuthSource::Config;
    }
    if let Some(max_concurrent_tasks) = cli_args.max_concurrent_tasks {
        changed |= config.max_concurrent_tasks != max_concurrent_tasks;
        config.max_concurrent_tasks = max_concurrent_tasks;
    }
    if changed {
        if let Err(e) = config.validate().and_then(|_| config.save(&cli_args.config_file)) {
            error!("Failed to apply configuration overrides: {}", e);
            std::process::exit(1);
        }
        info!("Configuration overrides applied and persisted to disk");
    }

    let mut worker = match Worker::new(config) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize worker: {}", e);
            std::process::exit(1);
        }
    };

    // Run the worker and the shutdown signal handler concurrently.
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                error!("Worker error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    worker.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
