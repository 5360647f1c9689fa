//! Herdsman Reference Worker
//!
//! Reads length-prefixed request frames from stdin and writes one response
//! frame per request to stdout. Logs go to stderr, which the orchestrator
//! forwards into its own log.

use std::sync::Arc;

use clap::Parser;
use herdsman_ipc::serve;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing. Stdout carries frames, so logs must stay on stderr.
    // Every forwarded line surfaces at warn in the orchestrator, hence the
    // quieter default.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .init();

    let config = Config::parse();
    config.validate()?;

    info!(
        worker_id = %config.worker_id,
        length_field_length = config.length_field_length,
        max_frame_length = config.max_frame_length,
        "Starting herdsman worker"
    );

    let engine = Arc::new(Engine::new(config.worker_id.clone(), config.cache_entries));
    let exit = serve(
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        engine,
        config.frame(),
    )
    .await?;

    info!(worker_id = %config.worker_id, exit = ?exit, "Worker stopped");
    Ok(())
}
