//! Worker IPC for herdsman.
//!
//! Workers are separate processes that read one length-prefixed request frame
//! from stdin and write exactly one length-prefixed response frame to stdout
//! per request. This crate owns both ends of that contract:
//!
//! - [`WorkerHandle`] spawns a worker through a [`WorkerLauncher`], submits
//!   requests one at a time and terminates the process.
//! - [`codec`] frames messages and enforces deadlines, draining late
//!   responses so a timed out stream is never read out of step.
//! - [`serve`] is the worker-side loop used by worker binaries.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use herdsman_core::{Request, WorkerId};
//! use herdsman_ipc::{HandleOptions, ProcessLauncher, WorkerHandle};
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let launcher = ProcessLauncher::new("herdsman-worker");
//!     let mut handle =
//!         WorkerHandle::spawn(WorkerId::new("w-0"), &launcher, HandleOptions::default()).await?;
//!
//!     let response = handle
//!         .submit(&Request::new("echo", b"hello".to_vec(), Duration::from_secs(5)))
//!         .await?;
//!     assert!(response.success);
//!
//!     handle.terminate(true).await;
//!     Ok(())
//! }
//! ```

pub mod codec;
mod error;
mod handle;
mod launcher;
pub mod protocol;
pub mod serve;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::{BoxedReader, BoxedWriter, FrameChannel, FrameConfig};
pub use error::IpcError;
pub use handle::{HandleOptions, WorkerHandle};
pub use launcher::{
    ProcessLauncher, WorkerConnection, WorkerLauncher, LENGTH_FIELD_ENV, MAX_FRAME_ENV, WORKER_ID_ENV,
};
pub use protocol::{WireRequest, WireResponse};
pub use serve::{serve, RequestHandler, ServeExit};
