//! Orchestrator configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use herdsman_core::{ErrorKind, RecoveryStep};
use herdsman_ipc::{FrameConfig, HandleOptions, ProcessLauncher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pool: PoolConfig,
    pub ipc: IpcConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub http: HttpConfig,
}

/// Worker pool sizing and worker launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub size: usize,

    /// Upper bound on waiting for an idle worker.
    pub acquire_timeout_ms: u64,

    /// Worker executable, resolved through `PATH` when not absolute.
    pub worker_program: String,

    pub worker_args: Vec<String>,

    pub worker_env: BTreeMap<String, String>,

    /// Time allowed for a fresh worker to answer its first ping.
    pub startup_timeout_ms: u64,

    /// Time allowed for a worker to exit after a graceful shutdown request.
    pub graceful_shutdown_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout_ms: 5_000,
            worker_program: "herdsman-worker".to_string(),
            worker_args: Vec::new(),
            worker_env: BTreeMap::new(),
            startup_timeout_ms: 5_000,
            graceful_shutdown_ms: 2_000,
        }
    }
}

/// Framing and request timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// Deadline applied to requests that do not carry one.
    pub default_timeout_ms: u64,

    /// How long to drain a late response after a timeout.
    pub drain_grace_ms: u64,

    /// Length prefix width in bytes (1 to 8).
    pub length_field_length: usize,

    pub max_frame_length: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        let frame = FrameConfig::default();
        Self {
            default_timeout_ms: 30_000,
            drain_grace_ms: 100,
            length_field_length: frame.length_field_length,
            max_frame_length: frame.max_frame_length,
        }
    }
}

/// Warning and critical levels for one resource, as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.90,
        }
    }
}

/// Health sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub history_capacity: usize,

    /// Mount point whose disk usage is sampled.
    pub disk_path: PathBuf,

    pub cpu: Thresholds,
    pub memory: Thresholds,
    pub disk: Thresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            history_capacity: 1_000,
            disk_path: PathBuf::from("/"),
            cpu: Thresholds::default(),
            memory: Thresholds::default(),
            disk: Thresholds::default(),
        }
    }
}

/// Recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Failed recoveries allowed per error kind before refusing.
    pub max_attempts: u32,

    /// Per-kind replacements for `max_attempts`.
    pub max_attempts_overrides: BTreeMap<ErrorKind, u32>,

    /// Per-kind replacements for the built-in step lists.
    pub strategies: BTreeMap<ErrorKind, Vec<RecoveryStep>>,

    /// Upper bound on a single health probe.
    pub probe_timeout_ms: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Extra time granted to recovery and the retry beyond the request
    /// deadline. Zero means the retry shares the original deadline.
    pub retry_deadline_extension_ms: u64,

    /// Least time recovery gets from the moment it starts. Applies when the
    /// request deadline is already spent, as after a worker timeout.
    pub min_recovery_budget_ms: u64,

    /// Recovery budget for health-triggered recovery, which has no request
    /// deadline to inherit.
    pub health_recovery_budget_ms: u64,

    /// Upper bound on waiting for another recovery of the same kind.
    pub ledger_lock_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_attempts_overrides: BTreeMap::new(),
            strategies: BTreeMap::new(),
            probe_timeout_ms: 1_000,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            retry_deadline_extension_ms: 0,
            min_recovery_budget_ms: 1_000,
            health_recovery_budget_ms: 30_000,
            ledger_lock_timeout_ms: 10_000,
        }
    }
}

/// HTTP admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7070".to_string(),
        }
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        if self.pool.worker_program.trim().is_empty() {
            return Err(ConfigError::Invalid("pool.worker_program is empty".into()));
        }
        if !(1..=8).contains(&self.ipc.length_field_length) {
            return Err(ConfigError::Invalid(format!(
                "ipc.length_field_length must be between 1 and 8, got {}",
                self.ipc.length_field_length
            )));
        }
        if self.ipc.max_frame_length == 0 {
            return Err(ConfigError::Invalid(
                "ipc.max_frame_length must be positive".into(),
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.interval_ms must be positive".into(),
            ));
        }
        if self.health.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "health.history_capacity must be at least 1".into(),
            ));
        }
        for (name, t) in [
            ("cpu", self.health.cpu),
            ("memory", self.health.memory),
            ("disk", self.health.disk),
        ] {
            let in_range = |v: f64| (0.0..=1.0).contains(&v);
            if !in_range(t.warning) || !in_range(t.critical) || t.warning > t.critical {
                return Err(ConfigError::Invalid(format!(
                    "health.{name}: thresholds must satisfy 0 <= warning <= critical <= 1"
                )));
            }
        }
        if self.recovery.max_attempts == 0
            || self.recovery.max_attempts_overrides.values().any(|&m| m == 0)
        {
            return Err(ConfigError::Invalid(
                "recovery max attempts must be at least 1".into(),
            ));
        }
        if let Some((kind, _)) = self
            .recovery
            .strategies
            .iter()
            .find(|(_, steps)| steps.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "recovery.strategies.{kind} has no steps"
            )));
        }
        if self.recovery.backoff_base_ms > self.recovery.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "recovery.backoff_base_ms exceeds backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc.default_timeout_ms)
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            length_field_length: self.ipc.length_field_length,
            max_frame_length: self.ipc.max_frame_length,
        }
    }

    /// Options applied to every worker handle.
    pub fn handle_options(&self) -> HandleOptions {
        HandleOptions {
            frame: self.frame_config(),
            drain_grace: Duration::from_millis(self.ipc.drain_grace_ms),
            graceful_timeout: Duration::from_millis(self.pool.graceful_shutdown_ms),
            startup_timeout: Some(Duration::from_millis(self.pool.startup_timeout_ms)),
        }
    }

    /// Launcher for the configured worker executable.
    pub fn launcher(&self) -> ProcessLauncher {
        self.pool.worker_env.iter().fold(
            ProcessLauncher::new(self.pool.worker_program.clone())
                .with_args(self.pool.worker_args.iter().cloned())
                .with_frame(self.frame_config()),
            |launcher, (key, value)| launcher.with_env(key.clone(), value.clone()),
        )
    }
}
