//! Launchers create the process behind a worker handle.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use herdsman_core::WorkerId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::codec::{BoxedReader, BoxedWriter, FrameConfig};
use crate::error::IpcError;

/// Environment variable carrying the worker id into the child process.
pub const WORKER_ID_ENV: &str = "HERDSMAN_WORKER_ID";

/// Length prefix width the worker must use, set by [`ProcessLauncher::with_frame`].
pub const LENGTH_FIELD_ENV: &str = "HERDSMAN_LENGTH_FIELD_LENGTH";

/// Largest frame body the worker may accept or produce.
pub const MAX_FRAME_ENV: &str = "HERDSMAN_MAX_FRAME_LENGTH";

/// The raw streams of a freshly launched worker.
pub struct WorkerConnection {
    /// Worker output (its stdout).
    pub reader: BoxedReader,

    /// Worker input (its stdin).
    pub writer: BoxedWriter,

    /// OS process, if the worker is a real process.
    pub child: Option<Child>,
}

/// Seam between worker handles and whatever hosts the worker.
///
/// The orchestrator uses [`ProcessLauncher`]; tests use in-memory launchers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, id: &WorkerId) -> Result<WorkerConnection, IpcError>;
}

/// Launches workers as child processes speaking the frame protocol on stdio.
///
/// # Example
///
/// ```rust,no_run
/// use herdsman_ipc::ProcessLauncher;
///
/// let launcher = ProcessLauncher::new("herdsman-worker")
///     .with_arg("--cache-entries")
///     .with_arg("128")
///     .with_env("RUST_LOG", "info");
/// ```
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Path to the worker executable.
    program: String,

    /// Arguments passed on every launch.
    args: Vec<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,

    /// Working directory (optional).
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    /// The program can be a bare name for PATH lookup, or a full path.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Tell the worker which frame layout to speak.
    pub fn with_frame(self, frame: FrameConfig) -> Self {
        self.with_env(LENGTH_FIELD_ENV, frame.length_field_length.to_string())
            .with_env(MAX_FRAME_ENV, frame.max_frame_length.to_string())
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, id: &WorkerId) -> Result<WorkerConnection, IpcError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(worker_id = %id, program = %self.program, error = %e, "Failed to spawn worker process");
            e
        })?;

        info!(worker_id = %id, pid = ?child.id(), "Worker process spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::Startup("failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::Startup("failed to get stdout".to_string()))?;

        // Forward stderr into our logs
        if let Some(stderr) = child.stderr.take() {
            let worker_id = id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                warn!(worker_id = %worker_id, stderr = %trimmed, "Worker stderr");
                            }
                        }
                        Err(e) => {
                            error!(worker_id = %worker_id, error = %e, "Error reading worker stderr");
                            break;
                        }
                    }
                }
            });
        }

        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_builder() {
        let launcher = ProcessLauncher::new("herdsman-worker")
            .with_arg("--cache-entries")
            .with_args(["16", "--quiet"])
            .with_env("RUST_LOG", "debug")
            .with_frame(FrameConfig::default())
            .with_working_dir("/tmp");

        assert_eq!(launcher.program(), "herdsman-worker");
        assert_eq!(launcher.args, vec!["--cache-entries", "16", "--quiet"]);
        assert_eq!(launcher.env_vars.len(), 3);
        assert!(launcher
            .env_vars
            .contains(&(LENGTH_FIELD_ENV.to_string(), "4".to_string())));
        assert_eq!(launcher.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher = ProcessLauncher::new("/nonexistent/herdsman-worker-binary");
        let result = launcher.launch(&WorkerId::new("w-missing")).await;
        assert!(matches!(result, Err(IpcError::Spawn(_))));
    }
}
