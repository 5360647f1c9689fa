//! HTTP request handlers.

mod execute;
mod health;
mod ledger;
mod workers;

pub use execute::execute;
pub use health::{health_check, health_history, health_snapshot, health_trend, metrics_handler};
pub use ledger::{get_ledger, reset_ledger};
pub use workers::list_workers;
