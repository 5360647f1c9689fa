//! Worker side of the frame protocol.
//!
//! A worker binary builds a [`RequestHandler`] for its engine and hands its
//! stdin/stdout to [`serve`]. Requests are processed strictly one at a time,
//! and each response is fully encoded before it is written.

use std::sync::Arc;

use async_trait::async_trait;
use herdsman_core::RawError;
use tracing::{debug, info, warn};

use crate::codec::{BoxedReader, BoxedWriter, FrameChannel, FrameConfig};
use crate::error::IpcError;
use crate::protocol::{WireRequest, WireResponse, OP_SHUTDOWN};

/// Engine callbacks for a worker process.
///
/// Reserved operations other than `__shutdown` (see [`crate::protocol`]) are
/// delivered here too; the shutdown reply is handled by [`serve`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>, RawError>;
}

/// Why the serve loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The orchestrator asked us to shut down.
    Shutdown,
    /// Our input stream closed.
    InputClosed,
}

/// Serve requests until shutdown or end of input.
pub async fn serve(
    reader: BoxedReader,
    writer: BoxedWriter,
    handler: Arc<dyn RequestHandler>,
    config: FrameConfig,
) -> Result<ServeExit, IpcError> {
    let mut channel = FrameChannel::new(reader, writer, config);
    let mut served = 0u64;

    loop {
        let Some(frame) = channel.read_frame().await? else {
            info!(served, "Input closed");
            return Ok(ServeExit::InputClosed);
        };

        let request: WireRequest = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Answer if we can still find the id, so the caller is not left waiting.
                let id = serde_json::from_slice::<serde_json::Value>(&frame)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64));
                warn!(error = %e, id = ?id, "Malformed request frame");
                if let Some(id) = id {
                    let error = RawError::new(format!("invalid operation: malformed request: {e}"));
                    channel.send_json(&WireResponse::failed(id, error)).await?;
                }
                continue;
            }
        };

        debug!(
            request_id = request.id,
            operation = %request.operation,
            payload_len = request.payload.len(),
            "Request received"
        );

        if request.operation == OP_SHUTDOWN {
            channel
                .send_json(&WireResponse::ok(request.id, Vec::new()))
                .await?;
            info!(served, "Shutdown requested");
            return Ok(ServeExit::Shutdown);
        }

        let response = match handler.handle(&request.operation, request.payload).await {
            Ok(result) => WireResponse::ok(request.id, result),
            Err(error) => WireResponse::failed(request.id, error),
        };
        channel.send_json(&response).await?;
        served += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, split};

    struct Upper;

    #[async_trait]
    impl RequestHandler for Upper {
        async fn handle(&self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>, RawError> {
            match operation {
                "upper" => Ok(payload.to_ascii_uppercase()),
                other => Err(RawError::new(format!("invalid operation: {other}"))),
            }
        }
    }

    fn request(id: u64, operation: &str, payload: &[u8]) -> WireRequest {
        WireRequest {
            id,
            operation: operation.to_string(),
            payload: payload.to_vec(),
            deadline_ms: 1000,
        }
    }

    async fn recv(channel: &mut FrameChannel) -> WireResponse {
        let frame = channel.read_frame().await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let (client, worker) = duplex(64 * 1024);
        let (wr, ww) = split(worker);
        let task = tokio::spawn(serve(
            Box::new(wr),
            Box::new(ww),
            Arc::new(Upper),
            FrameConfig::default(),
        ));

        let (cr, cw) = split(client);
        let mut channel = FrameChannel::new(Box::new(cr), Box::new(cw), FrameConfig::default());

        channel.send_json(&request(1, "upper", b"abc")).await.unwrap();
        let response = recv(&mut channel).await;
        assert_eq!(response.id, 1);
        assert_eq!(response.result, Some(b"ABC".to_vec()));

        channel.send_json(&request(2, "drop_table", b"")).await.unwrap();
        let response = recv(&mut channel).await;
        assert!(!response.success);

        channel.write_frame(Bytes::from_static(br#"{"id":3,"operation":7}"#)).await.unwrap();
        let response = recv(&mut channel).await;
        assert_eq!(response.id, 3);
        assert!(response.error.unwrap().message.contains("malformed request"));

        channel.send_json(&request(4, OP_SHUTDOWN, b"")).await.unwrap();
        let response = recv(&mut channel).await;
        assert!(response.success);

        assert_eq!(task.await.unwrap().unwrap(), ServeExit::Shutdown);
    }

    #[tokio::test]
    async fn test_serve_stops_on_input_closed() {
        let (client, worker) = duplex(1024);
        let (wr, ww) = split(worker);
        drop(client);

        let exit = serve(Box::new(wr), Box::new(ww), Arc::new(Upper), FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(exit, ServeExit::InputClosed);
    }
}
