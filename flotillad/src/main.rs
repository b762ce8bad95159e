//! Flotilla daemon.
//!
//! Serves the declarative group API, reconciles the cluster toward the
//! committed root through deployment plans, and supervises the health of
//! every running workload.

#![forbid(unsafe_code)]

mod api;
mod config;
mod events;
mod executor;
mod health;
mod manager;

use api::{AllowAll, ApiState, create_router};
use clap::Parser;
use config::DaemonConfig;
use events::EventBus;
use executor::{DeploymentExecutor, ExecutorConfig};
use flotilla_core::{InMemoryRepository, MockCluster, Repository, TaskLaunchFacade};
use health::{HealthRegistry, NetworkProber};
use manager::GroupManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "flotillad")]
#[command(author, version, about = "Flotilla daemon - group orchestration control plane")]
struct Cli {
    /// Path to TOML configuration
    #[arg(short, long, env = "FLOTILLA_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the HTTP API (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

/// Exit codes: 0 clean shutdown, 1 configuration error, 2 repository
/// unreachable at start.
async fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(config.log_level.clone())
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting Flotilla daemon...");

    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let facade: Arc<dyn TaskLaunchFacade> = Arc::new(MockCluster::new());
    let events = EventBus::new(config.event_buffer);
    let registry = Arc::new(HealthRegistry::new(
        facade.clone(),
        events.clone(),
        Arc::new(NetworkProber::new()),
    ));
    let executor = Arc::new(DeploymentExecutor::new(
        facade.clone(),
        repo.clone(),
        registry,
        events.clone(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        },
    ));

    let manager = match GroupManager::load(repo, executor.clone(), events.clone()).await {
        Ok(manager) => manager,
        Err(err) => {
            error!("repository unreachable: {err}");
            return 2;
        }
    };

    let state = ApiState {
        manager,
        executor,
        facade,
        events,
        authorizer: Arc::new(AllowAll),
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
    };
    let router = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("configuration error: cannot bind {addr}: {err}");
            return 1;
        }
    };
    info!("Listening on {addr}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;
    match served {
        Ok(()) => {
            info!("Daemon stopped");
            0
        }
        Err(err) => {
            error!("server error: {err}");
            1
        }
    }
}
