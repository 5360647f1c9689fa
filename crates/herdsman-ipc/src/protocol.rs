//! Wire messages carried inside each frame.
//!
//! Every frame body is one JSON object. Payloads are base64 so arbitrary
//! bytes survive the JSON layer.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use herdsman_core::{RawError, Response};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Liveness probe. Must be cheap and side-effect free.
pub const OP_PING: &str = "__ping";
/// Release caches and temporary storage held by the engine.
pub const OP_CLEANUP: &str = "__cleanup";
/// Close and reopen the engine connection.
pub const OP_RECONNECT: &str = "__reconnect";
/// Run an integrity self-check.
pub const OP_VERIFY: &str = "__verify";
/// Reply, then exit with status 0.
pub const OP_SHUTDOWN: &str = "__shutdown";

/// Returns true for operations every worker must honor.
pub fn is_reserved(operation: &str) -> bool {
    operation.starts_with("__")
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Per-handle sequence number, echoed in the response.
    pub id: u64,

    pub operation: String,

    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// Time the worker has left, in milliseconds, when the frame was written.
    pub deadline_ms: u64,
}

/// A response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,

    pub success: bool,

    #[serde(default, with = "base64_opt")]
    pub result: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RawError>,
}

impl WireResponse {
    pub fn ok(id: u64, result: Vec<u8>) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: u64, error: RawError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

impl From<WireResponse> for Response {
    fn from(wire: WireResponse) -> Self {
        Response {
            success: wire.success,
            result: wire.result,
            error: wire.error,
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
