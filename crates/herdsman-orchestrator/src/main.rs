//! Herdsman Orchestrator Server

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use herdsman_orchestrator::health::SystemProbe;
use herdsman_orchestrator::{http, Config, Orchestrator};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "herdsman-orchestrator")]
#[command(about = "Supervise a pool of worker processes and recover them from failures")]
struct Args {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address, overriding `[http].bind`.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::load(path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            Config::default()
        }
    };
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    let http_addr: SocketAddr = config.http.bind.parse()?;
    let disk_path = config.health.disk_path.clone();

    info!(
        pool_size = config.pool.size,
        worker_program = %config.pool.worker_program,
        http_addr = %http_addr,
        "Starting herdsman orchestrator"
    );

    let orchestrator = Orchestrator::from_config(config)?;
    orchestrator
        .start(Box::new(SystemProbe::new(disk_path)))
        .await;

    // Start HTTP server
    let http_router = http::create_router(orchestrator.clone());
    let http_listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(http_listener, http_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        // Without a signal handler the server runs until killed.
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
