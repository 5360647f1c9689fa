//! In-memory engine behind the reference worker.
//!
//! The engine keeps a bounded cache of recent payloads and a connection
//! generation so the reserved operations have real state to act on.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herdsman_core::RawError;
use herdsman_ipc::protocol::{OP_CLEANUP, OP_PING, OP_RECONNECT, OP_VERIFY};
use herdsman_ipc::RequestHandler;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Exit status used by the `crash` operation.
pub const CRASH_EXIT_CODE: i32 = 70;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid operation: unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid operation: sleep expects milliseconds as text, got {0:?}")]
    BadDuration(String),

    #[error("internal error: corruption detected, cache holds {held} entries with limit {limit}")]
    CacheOverflow { held: usize, limit: usize },

    /// Failure requested by the caller through the `fail` operation.
    #[error("{0}")]
    Requested(String),

    #[error("internal error: failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<EngineError> for RawError {
    fn from(err: EngineError) -> Self {
        RawError::new(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct PingReply<'a> {
    worker_id: &'a str,
    generation: u64,
    uptime_ms: i64,
    cached_entries: usize,
    served: u64,
}

#[derive(Debug, Serialize)]
struct CleanupReply {
    released_entries: usize,
    released_bytes: usize,
}

#[derive(Debug, Serialize)]
struct ReconnectReply {
    generation: u64,
}

#[derive(Debug, Serialize)]
struct VerifyReply {
    cached_entries: usize,
    cached_bytes: usize,
}

#[derive(Debug, Default)]
struct Session {
    generation: u64,
    cache: VecDeque<Vec<u8>>,
    served: u64,
}

impl Session {
    fn cached_bytes(&self) -> usize {
        self.cache.iter().map(Vec::len).sum()
    }
}

/// Request handler for the reference worker.
pub struct Engine {
    worker_id: String,
    started_at: DateTime<Utc>,
    cache_limit: usize,
    session: Mutex<Session>,
}

impl Engine {
    pub fn new(worker_id: impl Into<String>, cache_limit: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            cache_limit,
            session: Mutex::new(Session::default()),
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>, EngineError> {
        match operation {
            OP_PING => self.ping(),
            OP_CLEANUP => self.cleanup(),
            OP_RECONNECT => self.reconnect(),
            OP_VERIFY => self.verify(),
            "echo" => Ok(self.echo(payload)),
            "sleep" => {
                let millis = parse_millis(&payload)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Vec::new())
            }
            "fail" => Err(EngineError::Requested(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            "crash" => {
                // Unrecoverable by definition: no response is written.
                tracing::error!(worker_id = %self.worker_id, "Crash requested, exiting");
                std::process::exit(CRASH_EXIT_CODE);
            }
            other => Err(EngineError::UnknownOperation(other.to_string())),
        }
    }

    fn echo(&self, payload: Vec<u8>) -> Vec<u8> {
        let mut session = self.session();
        session.served += 1;
        if session.cache.len() == self.cache_limit {
            session.cache.pop_front();
        }
        session.cache.push_back(payload.clone());
        payload
    }

    fn ping(&self) -> Result<Vec<u8>, EngineError> {
        let session = self.session();
        let reply = PingReply {
            worker_id: &self.worker_id,
            generation: session.generation,
            uptime_ms: (Utc::now() - self.started_at).num_milliseconds(),
            cached_entries: session.cache.len(),
            served: session.served,
        };
        Ok(serde_json::to_vec(&reply)?)
    }

    fn cleanup(&self) -> Result<Vec<u8>, EngineError> {
        let mut session = self.session();
        let reply = CleanupReply {
            released_entries: session.cache.len(),
            released_bytes: session.cached_bytes(),
        };
        session.cache.clear();
        info!(
            released_entries = reply.released_entries,
            released_bytes = reply.released_bytes,
            "Cache released"
        );
        Ok(serde_json::to_vec(&reply)?)
    }

    fn reconnect(&self) -> Result<Vec<u8>, EngineError> {
        let mut session = self.session();
        session.generation += 1;
        info!(generation = session.generation, "Engine connection reopened");
        Ok(serde_json::to_vec(&ReconnectReply {
            generation: session.generation,
        })?)
    }

    fn verify(&self) -> Result<Vec<u8>, EngineError> {
        let session = self.session();
        if session.cache.len() > self.cache_limit {
            return Err(EngineError::CacheOverflow {
                held: session.cache.len(),
                limit: self.cache_limit,
            });
        }
        Ok(serde_json::to_vec(&VerifyReply {
            cached_entries: session.cache.len(),
            cached_bytes: session.cached_bytes(),
        })?)
    }
}

fn parse_millis(payload: &[u8]) -> Result<u64, EngineError> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| EngineError::BadDuration(String::from_utf8_lossy(payload).into_owned()))
}

#[async_trait]
impl RequestHandler for Engine {
    async fn handle(&self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>, RawError> {
        debug!(operation, payload_len = payload.len(), "Handling request");
        Ok(self.dispatch(operation, payload).await?)
    }
}
