//! Length-prefixed framing over a worker's stdio.
//!
//! Frames are `[length: N bytes, big endian][body: length bytes]` where `N`
//! is [`FrameConfig::length_field_length`]. Length prefixes, unlike line
//! delimiters, let a late response be skipped whole after a timeout without
//! guessing where it ends.

use std::cmp::Ordering;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::error::IpcError;
use crate::protocol::{WireRequest, WireResponse};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame layout shared by both ends of a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Width of the length prefix in bytes (1..=8).
    pub length_field_length: usize,

    /// Largest accepted frame body.
    pub max_frame_length: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            length_field_length: 4,
            max_frame_length: 16 * 1024 * 1024,
        }
    }
}

impl FrameConfig {
    /// Largest body the length prefix can describe.
    pub fn representable_max(&self) -> usize {
        let width = self.length_field_length.clamp(1, 8);
        if width >= std::mem::size_of::<usize>() {
            usize::MAX
        } else {
            (1usize << (width * 8)) - 1
        }
    }

    /// Effective limit: the configured maximum, capped by the prefix width.
    pub fn effective_max(&self) -> usize {
        self.max_frame_length.min(self.representable_max())
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(self.length_field_length.clamp(1, 8))
            .max_frame_length(self.effective_max())
            .new_codec()
    }
}

/// Bidirectional frame stream over a reader/writer pair.
pub struct FrameChannel {
    reader: FramedRead<BoxedReader, LengthDelimitedCodec>,
    writer: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
    max_frame_length: usize,
}

impl FrameChannel {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, config: FrameConfig) -> Self {
        Self {
            reader: FramedRead::new(reader, config.codec()),
            writer: FramedWrite::new(writer, config.codec()),
            max_frame_length: config.effective_max(),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Write one whole frame and flush it.
    pub async fn write_frame(&mut self, body: Bytes) -> Result<(), IpcError> {
        if body.len() > self.max_frame_length {
            return Err(IpcError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_length,
            });
        }
        trace!(len = body.len(), "Writing frame");
        self.writer
            .send(body)
            .await
            .map_err(|e| IpcError::transport(format!("write failed: {e}")))
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn read_frame(&mut self) -> Result<Option<BytesMut>, IpcError> {
        match self.reader.next().await {
            Some(Ok(frame)) => {
                trace!(len = frame.len(), "Read frame");
                Ok(Some(frame))
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(IpcError::Decode(e.to_string()))
            }
            Some(Err(e)) => Err(IpcError::transport(format!("read failed: {e}"))),
            None => Ok(None),
        }
    }

    /// Serialize `message` as JSON and write it as one frame.
    pub async fn send_json<T: serde::Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| IpcError::transport(format!("failed to encode message: {e}")))?;
        self.write_frame(Bytes::from(body)).await
    }
}

/// Send `request` and wait for its response until `deadline`.
///
/// Responses with an older id are leftovers from an earlier timed out request
/// and are skipped. On timeout, a late response is drained for up to
/// `drain_grace` before returning [`IpcError::Timeout`].
pub async fn exchange(
    channel: &mut FrameChannel,
    request: &WireRequest,
    deadline: Instant,
    drain_grace: Duration,
) -> Result<WireResponse, IpcError> {
    let started = Instant::now();

    match timeout_at(deadline, channel.send_json(request)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(IpcError::Timeout {
                after: started.elapsed(),
            })
        }
    }

    match timeout_at(deadline, read_response(channel, request.id)).await {
        Ok(result) => result,
        Err(_) => {
            let drained = drain(channel, request.id, drain_grace).await;
            debug!(request_id = request.id, drained, "Response deadline elapsed");
            Err(IpcError::Timeout {
                after: started.elapsed(),
            })
        }
    }
}

/// Read frames until the response for `id` arrives.
async fn read_response(channel: &mut FrameChannel, id: u64) -> Result<WireResponse, IpcError> {
    loop {
        let frame = channel
            .read_frame()
            .await?
            .ok_or_else(|| IpcError::transport("worker closed its output stream"))?;

        let response: WireResponse =
            serde_json::from_slice(&frame).map_err(|e| IpcError::Decode(e.to_string()))?;

        match response.id.cmp(&id) {
            Ordering::Less => {
                warn!(stale_id = response.id, expected_id = id, "Discarding stale response");
            }
            Ordering::Equal => return Ok(response),
            Ordering::Greater => {
                return Err(IpcError::Decode(format!(
                    "response id {} does not match request id {}",
                    response.id, id
                )))
            }
        }
    }
}

/// Consume and discard the late response for `id`. Returns true if it arrived.
pub async fn drain(channel: &mut FrameChannel, id: u64, grace: Duration) -> bool {
    match timeout(grace, read_response(channel, id)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Drain stopped");
            false
        }
        Err(_) => false,
    }
}
