//! Herdsman Orchestrator Library
//!
//! Supervises a pool of worker processes, samples host resources, and turns
//! worker failures into classified, ledger-bounded recovery runs.

pub mod actions;
pub mod classifier;
pub mod config;
pub mod health;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod strategy;

pub use classifier::ErrorClassifier;
pub use config::{Config, ConfigError};
pub use ledger::RecoveryLedger;
pub use orchestrator::{ExecuteError, Execution, Orchestrator};
pub use pool::{PoolError, WorkerPool, WorkerSummary};
pub use recovery::{RecoveryExecutor, RecoveryReport};
pub use strategy::{RecoveryStrategy, StrategySelector};
