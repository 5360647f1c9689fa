//! In-memory scripted workers for tests.
//!
//! [`ScriptedLauncher`] hands out workers that live on a `tokio::io::duplex`
//! stream instead of a process. Each request is answered by a script
//! closure, which lets tests stage timeouts, crashes and failure messages.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use herdsman_core::{RawError, WorkerId};
use tokio::io::{duplex, split, DuplexStream};

use crate::codec::{FrameChannel, FrameConfig};
use crate::error::IpcError;
use crate::launcher::{WorkerConnection, WorkerLauncher};
use crate::protocol::{is_reserved, WireRequest, WireResponse, OP_PING, OP_SHUTDOWN};

/// How a scripted worker answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Vec<u8>),
    Fail(RawError),
    /// Wait, then answer.
    Delay(Duration, Box<Reply>),
    /// Never answer; discard further input until the stream closes.
    Hang,
    /// Close the stream without answering, as if the process died.
    Exit,
}

impl Reply {
    pub fn ok(result: impl Into<Vec<u8>>) -> Self {
        Self::Ok(result.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(RawError::new(message))
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Self::Delay(delay, Box::new(reply))
    }
}

type Script = Arc<dyn Fn(&str, &[u8]) -> Reply + Send + Sync>;

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    calls: Mutex<HashMap<String, usize>>,
}

impl Counters {
    fn record(&self, operation: &str) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        *calls.entry(operation.to_string()).or_default() += 1;
    }
}

/// Launcher producing in-memory workers driven by a script.
#[derive(Clone)]
pub struct ScriptedLauncher {
    script: Script,
    frame: FrameConfig,
    counters: Arc<Counters>,
    refuse: Arc<AtomicBool>,
}

impl ScriptedLauncher {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Reply + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            frame: FrameConfig::default(),
            counters: Arc::new(Counters::default()),
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Answers pings with `pong`, other reserved operations with an empty
    /// success, and echoes everything else.
    pub fn echo() -> Self {
        Self::new(|operation, payload| match operation {
            OP_PING => Reply::ok(b"pong".to_vec()),
            op if is_reserved(op) => Reply::ok(Vec::new()),
            _ => Reply::ok(payload.to_vec()),
        })
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// Make subsequent launches fail as if the OS refused to spawn.
    pub fn refuse_launches(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Successful launches so far.
    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Shutdown requests received across all workers.
    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    /// Requests received for `operation` across all workers.
    pub fn calls(&self, operation: &str) -> usize {
        self.counters
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self, _id: &WorkerId) -> Result<WorkerConnection, IpcError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(IpcError::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "launch refused by test",
            )));
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);

        let (client, worker) = duplex(1024 * 1024);
        tokio::spawn(run_worker(
            worker,
            Arc::clone(&self.script),
            Arc::clone(&self.counters),
            self.frame,
        ));

        let (reader, writer) = split(client);
        Ok(WorkerConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }
}

async fn run_worker(stream: DuplexStream, script: Script, counters: Arc<Counters>, frame: FrameConfig) {
    let (reader, writer) = split(stream);
    let mut channel = FrameChannel::new(Box::new(reader), Box::new(writer), frame);

    while let Ok(Some(bytes)) = channel.read_frame().await {
        let Ok(request) = serde_json::from_slice::<WireRequest>(&bytes) else {
            return;
        };
        counters.record(&request.operation);

        if request.operation == OP_SHUTDOWN {
            counters.shutdowns.fetch_add(1, Ordering::SeqCst);
            let _ = channel.send_json(&WireResponse::ok(request.id, Vec::new())).await;
            return;
        }

        let mut reply = script(&request.operation, &request.payload);
        loop {
            match reply {
                Reply::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                }
                Reply::Ok(result) => {
                    let _ = channel.send_json(&WireResponse::ok(request.id, result)).await;
                    break;
                }
                Reply::Fail(error) => {
                    let _ = channel.send_json(&WireResponse::failed(request.id, error)).await;
                    break;
                }
                Reply::Hang => {
                    while let Ok(Some(_)) = channel.read_frame().await {}
                    return;
                }
                Reply::Exit => return,
            }
        }
    }
}
