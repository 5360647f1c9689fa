//! Worker configuration.

use clap::Parser;
use herdsman_ipc::FrameConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("length field must be 1 to 8 bytes, got {0}")]
    LengthField(usize),

    #[error("max frame length must be positive")]
    MaxFrameLength,

    #[error("cache must hold at least one entry")]
    CacheEntries,
}

/// Command line and environment settings.
///
/// The orchestrator passes the worker id and frame layout through the
/// environment; the flags exist for running a worker by hand.
#[derive(Debug, Clone, Parser)]
#[command(name = "herdsman-worker")]
#[command(about = "Reference worker speaking the herdsman frame protocol on stdio")]
pub struct Config {
    /// Worker ID assigned by the orchestrator.
    #[arg(long, env = "HERDSMAN_WORKER_ID", default_value = "standalone")]
    pub worker_id: String,

    /// Width of the frame length prefix in bytes.
    #[arg(long, env = "HERDSMAN_LENGTH_FIELD_LENGTH", default_value_t = 4)]
    pub length_field_length: usize,

    /// Largest frame body accepted or produced.
    #[arg(long, env = "HERDSMAN_MAX_FRAME_LENGTH", default_value_t = 16 * 1024 * 1024)]
    pub max_frame_length: usize,

    /// Recent payloads kept by the engine until the next cleanup.
    #[arg(long, default_value_t = 64)]
    pub cache_entries: usize,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=8).contains(&self.length_field_length) {
            return Err(ConfigError::LengthField(self.length_field_length));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::MaxFrameLength);
        }
        if self.cache_entries == 0 {
            return Err(ConfigError::CacheEntries);
        }
        Ok(())
    }

    pub fn frame(&self) -> FrameConfig {
        FrameConfig {
            length_field_length: self.length_field_length,
            max_frame_length: self.max_frame_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsman_ipc::{LENGTH_FIELD_ENV, MAX_FRAME_ENV, WORKER_ID_ENV};

    #[test]
    fn test_defaults_match_orchestrator_frame() {
        let config = Config::parse_from(["herdsman-worker"]);
        config.validate().unwrap();
        assert_eq!(config.frame(), FrameConfig::default());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "herdsman-worker",
            "--worker-id",
            "w-7",
            "--length-field-length",
            "2",
            "--cache-entries",
            "8",
        ]);
        assert_eq!(config.worker_id, "w-7");
        assert_eq!(config.frame().representable_max(), 65_535);
        assert_eq!(config.cache_entries, 8);
    }

    #[test]
    fn test_rejects_bad_layout() {
        let config = Config::parse_from(["herdsman-worker", "--length-field-length", "9"]);
        assert!(matches!(config.validate(), Err(ConfigError::LengthField(9))));
    }

    #[test]
    fn test_env_names_match_launcher() {
        // The clap attributes need literals; keep them in step with the launcher.
        assert_eq!(WORKER_ID_ENV, "HERDSMAN_WORKER_ID");
        assert_eq!(LENGTH_FIELD_ENV, "HERDSMAN_LENGTH_FIELD_LENGTH");
        assert_eq!(MAX_FRAME_ENV, "HERDSMAN_MAX_FRAME_LENGTH");
    }
}
