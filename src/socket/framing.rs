//! Wire protocol codec for the Unix socket transport.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: Event (UTF-8 JSON `{ "event", "data" }`): handshake, progress
//! - `0x02`: Chunk: one [`ChunkEnvelope`] of a request or response
//! - `0x03`: Broadcast: one [`ChunkEnvelope`] of a server broadcast
//!
//! Chunk and broadcast payloads share one binary layout:
//!
//! ```text
//! [u16 LE event_len][event][u16 LE key_len][key]
//! [u32 LE size][u32 LE index][u32 LE byte_length][data...]
//! ```

use anyhow::{anyhow, bail, Result};

use crate::protocol::{ChunkEnvelope, EventMessage};

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed part of a chunk header: two u16 lengths and three u32 fields.
const CHUNK_HEADER_FIXED: usize = 2 + 2 + 4 * 3;

/// Frame type constants.
pub mod frame_type {
    /// JSON event message.
    pub const EVENT: u8 = 0x01;
    /// Request or response chunk.
    pub const CHUNK: u8 = 0x02;
    /// Broadcast chunk (server → client).
    pub const BROADCAST: u8 = 0x03;
}

/// A decoded frame from the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Small JSON control message.
    Event(EventMessage),

    /// Chunk of a request (client → server) or response (server → client).
    Chunk {
        /// Event name the message is addressed to.
        event: String,
        /// The chunk.
        envelope: ChunkEnvelope,
    },

    /// Chunk of a broadcast Response Envelope (server → client).
    Broadcast {
        /// Event name subscribers listen on.
        event: String,
        /// The chunk.
        envelope: ChunkEnvelope,
    },
}

impl Frame {
    /// Shorthand for an event frame.
    pub fn event(event: impl Into<String>, data: serde_json::Value) -> Self {
        Frame::Event(EventMessage {
            event: event.into(),
            data,
        })
    }

    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    ///
    /// # Errors
    ///
    /// Fails if an event name or key exceeds `u16::MAX` bytes, or the frame
    /// exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Frame::Event(message) => {
                let payload = serde_json::to_vec(message)
                    .map_err(|e| anyhow!("Event serialization failed: {e}"))?;
                encode_raw(frame_type::EVENT, &payload)
            }
            Frame::Chunk { event, envelope } => {
                encode_raw(frame_type::CHUNK, &encode_chunk(event, envelope)?)
            }
            Frame::Broadcast { event, envelope } => {
                encode_raw(frame_type::BROADCAST, &encode_chunk(event, envelope)?)
            }
        }
    }
}

/// Encode the shared chunk payload layout.
fn encode_chunk(event: &str, envelope: &ChunkEnvelope) -> Result<Vec<u8>> {
    let event_len = u16::try_from(event.len())
        .map_err(|_| anyhow!("Event name too long: {} bytes", event.len()))?;
    let key_len = u16::try_from(envelope.key.len())
        .map_err(|_| anyhow!("Key too long: {} bytes", envelope.key.len()))?;

    let mut payload = Vec::with_capacity(
        CHUNK_HEADER_FIXED + event.len() + envelope.key.len() + envelope.data.len(),
    );
    payload.extend_from_slice(&event_len.to_le_bytes());
    payload.extend_from_slice(event.as_bytes());
    payload.extend_from_slice(&key_len.to_le_bytes());
    payload.extend_from_slice(envelope.key.as_bytes());
    payload.extend_from_slice(&envelope.size.to_le_bytes());
    payload.extend_from_slice(&envelope.index.to_le_bytes());
    payload.extend_from_slice(&envelope.byte_length.to_le_bytes());
    payload.extend_from_slice(&envelope.data);
    Ok(payload)
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = payload.len() + 1; // +1 for type byte
    if length > MAX_FRAME_SIZE as usize {
        bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
    }
    let mut buf = Vec::with_capacity(4 + length);
    buf.extend_from_slice(&(length as u32).to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Cursor over a chunk payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| anyhow!("Chunk frame truncated at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| anyhow!("Invalid UTF-8 in chunk header: {e}"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Decode the shared chunk payload layout.
fn decode_chunk(payload: &[u8]) -> Result<(String, ChunkEnvelope)> {
    if payload.len() < CHUNK_HEADER_FIXED {
        bail!("Chunk frame too short: {} bytes", payload.len());
    }
    let mut reader = Reader { buf: payload, pos: 0 };
    let event = reader.string()?;
    let key = reader.string()?;
    let size = reader.u32()?;
    let index = reader.u32()?;
    let byte_length = reader.u32()?;
    let data = reader.rest().to_vec();
    Ok((
        event,
        ChunkEnvelope {
            key,
            size,
            index,
            byte_length,
            data,
        },
    ))
}

/// Decode a single frame from a type byte and payload.
fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::EVENT => {
            let message: EventMessage = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("Invalid event frame: {e}"))?;
            Ok(Frame::Event(message))
        }
        frame_type::CHUNK => {
            let (event, envelope) = decode_chunk(payload)?;
            Ok(Frame::Chunk { event, envelope })
        }
        frame_type::BROADCAST => {
            let (event, envelope) = decode_chunk(payload)?;
            Ok(Frame::Broadcast { event, envelope })
        }
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns decoded frames. Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Need at least 4 bytes for the length header
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            // Extract the complete frame
            let frame_type = self.buf[4];
            let payload = &self.buf[5..total];
            let frame = decode_frame(frame_type, payload)?;
            frames.push(frame);

            // Remove consumed bytes
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
