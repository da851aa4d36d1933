//! Drover Agent - pulls pipeline work and runs it on compute backends.
//!
//! The agent registers the configured docker and kubernetes endpoints in a
//! worker pool, then runs dispatch workers that pull work items, reserve an
//! endpoint and execute the pipeline on it.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration
//! drover-agent
//!
//! # Start with a configuration file
//! drover-agent --config /etc/drover/agent.toml
//!
//! # Override specific options
//! drover-agent --queue-endpoint https://ci.example.com --workers 4
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  pull   ┌──────────────┐ reserve ┌──────────────────┐
//! │  Work queue   │────────►│  Dispatcher  │────────►│  Endpoint pool   │
//! └───────────────┘◄────────│   workers    │◄────────└──────────────────┘
//!                     ack   └──────┬───────┘ release
//!                                  │
//!                 ┌────────────────┼────────────────┐
//!                 ▼                ▼                ▼
//!          ┌────────────┐   ┌────────────┐   ┌────────────┐
//!          │  Engines   │   │ Log writer │   │ Event bus  │
//!          └────────────┘   └────────────┘   └────────────┘
//! ```

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentConfig;
use drover_core::Event;
use drover_orchestrator::{
    register_endpoints, BackendFactory, Cluster, Dispatcher, DockerFactory, EngineFactory, KubeFactory, LockManager,
};
use drover_transport::{EventBus, HttpQueue, MemoryQueue, QueueKind, TracingPeer, WorkQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments for the Drover Agent.
#[derive(Parser, Debug)]
#[command(
    name = "drover-agent",
    about = "Build agent running pipeline work on docker and kubernetes endpoints",
    version
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent ID.
    #[arg(long, value_name = "ID")]
    agent_id: Option<String>,

    /// Remote queue URL; switches the queue to http.
    #[arg(long, value_name = "URL")]
    queue_endpoint: Option<String>,

    /// Number of dispatch workers.
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long)]
    json_logs: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Initialize tracing/logging.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Builds the configured work queue.
fn build_queue(config: &AgentConfig) -> Result<Arc<dyn WorkQueue>> {
    match config.queue.kind {
        QueueKind::Http => {
            let queue = HttpQueue::from_config(&config.queue).context("Failed to create queue client")?;
            info!(endpoint = %queue.base_url(), "using remote work queue");
            Ok(Arc::new(queue))
        }
        QueueKind::Memory => {
            let queue = if config.queue.lease_secs > 0 {
                let queue = Arc::new(MemoryQueue::with_lease(Duration::from_secs(config.queue.lease_secs)));
                queue.spawn_reaper(Duration::from_secs(config.queue.lease_secs.max(2) / 2));
                queue
            } else {
                Arc::new(MemoryQueue::new())
            };
            info!("using in-process work queue");
            Ok(queue)
        }
    }
}

/// Logs every event announced on the bus until the bus drops the channel.
async fn log_events(mut events: mpsc::Receiver<Arc<Event>>) {
    while let Some(event) = events.recv().await {
        if let Some(task) = &event.task {
            info!(
                item = %task.id,
                status = %task.status,
                endpoint = task.endpoint.as_deref().unwrap_or("-"),
                failed_step = task.failed_step.as_deref().unwrap_or("-"),
                "task update"
            );
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    let agent_id = config.agent_id();
    info!(agent = %agent_id, "configuring agent");

    let queue = build_queue(&config)?;
    let locks = Arc::new(LockManager::new());
    let factory: Arc<dyn EngineFactory> = Arc::new(BackendFactory::new(
        DockerFactory::new(
            config.ambassador.enabled_config(),
            Arc::clone(&locks),
            config.dispatch.lock_timeout(),
        ),
        KubeFactory::new(),
    ));

    let cluster = Cluster::with_capacity(config.dispatch.pool_capacity);
    let registered = register_endpoints(factory.as_ref(), &cluster, config.endpoints.clone()).await;
    if registered == 0 {
        warn!("no reachable endpoints; work will wait until one is registered");
    }
    info!(registered, configured = config.endpoints.len(), "endpoints registered");

    let bus = EventBus::new();
    let (_, events) = bus.subscribe_channel(256).await;
    tokio::spawn(log_events(events));

    let dispatcher = Dispatcher::new(
        queue,
        cluster.clone(),
        factory,
        bus,
        Arc::new(TracingPeer),
        locks,
        config.dispatch.to_dispatch_config(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, finishing running builds");
            cancel.cancel();
        }
    });

    dispatcher.run(cancel).await;
    cluster.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if args.print_config {
        let config = AgentConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = if let Some(ref config_path) = args.config {
        AgentConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        AgentConfig::default()
    };

    config.merge_cli_args(&args);
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Drover Agent starting");

    if let Err(e) = run(config).await {
        error!(error = %e, "Agent failed");
        return Err(e);
    }

    info!("Drover Agent stopped");
    Ok(())
}
