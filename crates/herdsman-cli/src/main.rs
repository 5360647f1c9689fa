//! Herdsman CLI - Command line interface for the herdsman orchestrator.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use herdsman_core::{CommandOutcome, HealthSnapshot};
use tracing_subscriber::EnvFilter;

mod client;
mod error;

use client::{HttpClient, LedgerRow, TrendRow, WorkerRow};
use error::ClientError;

/// Herdsman CLI - orchestrator operations tool
#[derive(Parser)]
#[command(name = "herdsman")]
#[command(about = "CLI for the herdsman orchestrator", long_about = None)]
struct Cli {
    /// Orchestrator HTTP address
    #[arg(short, long, env = "HERDSMAN_URL", default_value = "http://127.0.0.1:7070")]
    url: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an operation on a worker
    Execute {
        /// Operation name
        operation: String,

        /// Payload as text
        #[arg(short, long, default_value = "", conflicts_with = "payload_base64")]
        payload: String,

        /// Payload as base64, for binary input
        #[arg(long)]
        payload_base64: Option<String>,

        /// Deadline in milliseconds
        #[arg(short, long)]
        deadline_ms: Option<u64>,
    },

    /// Show the latest resource snapshot
    Health,

    /// Show recent resource snapshots
    History {
        /// Number of most recent snapshots
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show average and peak utilization per resource
    Trend {
        /// Number of most recent snapshots to summarize
        #[arg(short, long)]
        window: Option<usize>,
    },

    /// Show recovery attempts per error kind
    Ledger,

    /// Reset recovery attempts
    #[command(name = "reset-ledger")]
    ResetLedger {
        /// Error kind to reset; all kinds when omitted
        error_kind: Option<String>,
    },

    /// List worker slots
    Workers,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = HttpClient::new(&cli.url);

    match cli.command {
        Commands::Execute {
            operation,
            payload,
            payload_base64,
            deadline_ms,
        } => {
            let payload = match payload_base64 {
                Some(encoded) => STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| ClientError::InvalidInput(format!("payload is not base64: {e}")))?,
                None => payload.into_bytes(),
            };
            let outcome = client.execute(&operation, &payload, deadline_ms).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            if !outcome.success {
                std::process::exit(2);
            }
        }
        Commands::Health => {
            let snapshot = client.health_snapshot().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshots(&[snapshot]);
            }
        }
        Commands::History { limit } => {
            let history = client.health_history(limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                println!("Snapshots ({}):", history.len());
                print_snapshots(&history);
            }
        }
        Commands::Trend { window } => {
            let rows = client.health_trend(window).await?;
            print_trend(&rows, cli.json)?;
        }
        Commands::Ledger => {
            let rows = client.ledger().await?;
            print_ledger(&rows, cli.json)?;
        }
        Commands::ResetLedger { error_kind } => {
            let rows = client.reset_ledger(error_kind.as_deref()).await?;
            match &error_kind {
                Some(kind) => println!("Ledger reset for {kind}"),
                None => println!("Ledger reset for all error kinds"),
            }
            print_ledger(&rows, cli.json)?;
        }
        Commands::Workers => {
            let workers = client.workers().await?;
            print_workers(&workers, cli.json)?;
        }
    }

    Ok(())
}

fn print_outcome(outcome: &CommandOutcome) {
    println!("  Success:    {}", outcome.success);
    println!("  Phase:      {:?}", outcome.phase);
    if let Some(result) = &outcome.result {
        match std::str::from_utf8(result) {
            Ok(text) => println!("  Result:     {text}"),
            Err(_) => println!("  Result:     base64:{}", STANDARD.encode(result)),
        }
    }
    if let Some(kind) = &outcome.error_kind {
        println!("  Error kind: {kind}");
    }
    if let Some(message) = &outcome.error_message {
        println!("  Error:      {message}");
    }

    if let Some(summary) = &outcome.recovery_summary {
        println!("  Recovery:   {}", summary.outcome.as_str());
        println!(
            "    Ledger:   {}/{} for {}",
            summary.ledger.attempts, summary.ledger.max, summary.error_kind
        );
        println!("    Retried:  {}", summary.retried);
        for record in &summary.steps {
            let status = match (&record.error, record.probe_succeeded) {
                (Some(error), _) => format!("failed: {error}"),
                (None, Some(true)) => "ok, probe passed".to_string(),
                (None, _) => "ok".to_string(),
            };
            println!("    - {} ({status})", record.step);
        }
    }
}

fn print_snapshots(snapshots: &[HealthSnapshot]) {
    println!("{:<20}  {:>6}  {:>6}  {:>6}", "TIMESTAMP", "CPU", "MEMORY", "DISK");
    println!("{}", "-".repeat(44));
    for snapshot in snapshots {
        println!(
            "{:<20}  {:>5.1}%  {:>5.1}%  {:>5.1}%",
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
            snapshot.usage.cpu * 100.0,
            snapshot.usage.memory * 100.0,
            snapshot.usage.disk * 100.0
        );
    }
}

fn print_trend(rows: &[TrendRow], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }

    if let Some(first) = rows.first() {
        println!("Over the last {} snapshots:", first.samples);
    }
    println!("{:<8}  {:>8}  {:>8}", "RESOURCE", "AVERAGE", "PEAK");
    println!("{}", "-".repeat(28));
    for row in rows {
        println!(
            "{:<8}  {:>7.1}%  {:>7.1}%",
            row.resource.as_str(),
            row.average * 100.0,
            row.peak * 100.0
        );
    }
    Ok(())
}

fn print_ledger(rows: &[LedgerRow], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }

    println!("{:<20}  {:<8}  {}", "ERROR KIND", "ATTEMPTS", "STATUS");
    println!("{}", "-".repeat(44));
    for row in rows {
        let status = if row.exhausted { "EXHAUSTED" } else { "OK" };
        println!(
            "{:<20}  {:<8}  {}",
            row.error_kind,
            format!("{}/{}", row.attempts, row.max),
            status
        );
    }
    Ok(())
}

fn print_workers(workers: &[WorkerRow], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(workers)?);
        return Ok(());
    }

    println!("Workers ({}):", workers.len());
    println!(
        "{:<4}  {:<36}  {:<12}  {:<8}  {:<8}  {}",
        "SLOT", "ID", "STATE", "OPS", "RESTARTS", "STARTED"
    );
    println!("{}", "-".repeat(96));
    for worker in workers {
        let state = match (worker.state, worker.busy) {
            (_, true) => "busy".to_string(),
            (Some(state), false) => state.to_string(),
            (None, false) => "not started".to_string(),
        };
        let started = worker
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4}  {:<36}  {:<12}  {:<8}  {:<8}  {}",
            worker.slot,
            worker.worker_id.as_deref().unwrap_or("-"),
            state,
            worker.operation_count,
            worker.restarts,
            started
        );
    }
    Ok(())
}
