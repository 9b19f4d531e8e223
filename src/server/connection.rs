//! Per-connection state for server-side sockets.
//!
//! Each accepted connection gets a [`Socket`] that owns the write task and
//! the negotiated session. The read task lives here too: it decodes frames,
//! feeds the connection's own [`Reassembler`], acknowledges chunks on the
//! `<key>~progress` channel, and hands complete messages to the dispatcher.
//! Reassembly buffers belong to the read task and die with it.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::dispatch;
use super::registry::SocketRegistry;
use super::session::Session;
use crate::constants::{progress_channel, EVENT_HANDSHAKE};
use crate::error::{ProtocolError, RpcError};
use crate::protocol::{ChunkEnvelope, Handshake, Progress, ResponseEnvelope};
use crate::socket::codec::{self, ChunkStatus, Reassembler};
use crate::socket::framing::{Frame, FrameDecoder};

/// Server-side handle for one live connection.
pub struct Socket {
    /// Unique identifier for this connection.
    id: String,
    /// Sender for outgoing encoded frames.
    frame_tx: UnboundedSender<Vec<u8>>,
    /// Session bound to this connection; rebound when the client resumes.
    session: RwLock<Arc<dyn Session>>,
    /// Outbound chunk size.
    chunk_size: usize,
    /// Read/write task handles (for cleanup).
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("session", &self.session().id())
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Create a socket and spawn its write task.
    ///
    /// The read task is started separately by [`Socket::spawn_reader`] once
    /// the socket is registered.
    pub(crate) fn new<W>(
        id: String,
        writer: W,
        session: Arc<dyn Session>,
        chunk_size: usize,
    ) -> Arc<Self>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let write_handle = tokio::spawn(Self::write_loop(id.clone(), writer, frame_rx));

        Arc::new(Self {
            id,
            frame_tx,
            session: RwLock::new(session),
            chunk_size,
            tasks: Mutex::new(vec![write_handle]),
        })
    }

    /// Socket identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session currently bound to this connection.
    pub fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn bind_session(&self, session: Arc<dyn Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Whether the write side is still open.
    pub fn is_connected(&self) -> bool {
        !self.frame_tx.is_closed()
    }

    /// Send a frame to this client.
    ///
    /// Returns `false` if the frame cannot be encoded or the client is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(encoded) => self.send_raw(encoded),
            Err(e) => {
                log::error!("[Socket] Failed to encode frame for {}: {e}", self.id);
                false
            }
        }
    }

    /// Send pre-encoded frame bytes to this client.
    pub fn send_raw(&self, encoded: Vec<u8>) -> bool {
        self.frame_tx.send(encoded).is_ok()
    }

    /// Chunk and send a Response Envelope on `event`.
    pub fn emit_response(&self, event: &str, envelope: &ResponseEnvelope) -> Result<(), ProtocolError> {
        let bytes = codec::encode(envelope)?;
        for chunk in codec::split(&envelope.key, &bytes, self.chunk_size)? {
            let frame = Frame::Chunk {
                event: event.to_string(),
                envelope: chunk,
            };
            if !self.send_frame(&frame) {
                return Err(ProtocolError::Closed);
            }
        }
        Ok(())
    }

    /// Send pre-encoded broadcast chunks.
    pub(crate) fn emit_encoded(&self, frames: &[Vec<u8>]) -> bool {
        frames.iter().all(|frame| self.send_raw(frame.clone()))
    }

    /// Respond to `key` with an error, outside the dispatcher.
    fn respond_error(&self, event: &str, key: &str, error: RpcError) {
        let envelope = ResponseEnvelope::failure(key, error.normalize());
        if let Err(e) = self.emit_response(event, &envelope) {
            log::warn!("[Socket] Failed to send error to {} for {key}: {e}", self.id);
        }
    }

    /// Announce the session and message cap to the client.
    pub(crate) fn send_handshake(&self, max_message_size: usize) -> bool {
        let handshake = Handshake {
            session_id: self.session().id().to_string(),
            socket_id: Some(self.id.clone()),
            max_message_size: Some(max_message_size),
        };
        match serde_json::to_value(&handshake) {
            Ok(data) => self.send_frame(&Frame::event(EVENT_HANDSHAKE, data)),
            Err(e) => {
                log::error!("[Socket] Failed to encode handshake: {e}");
                false
            }
        }
    }

    /// Disconnect this client, aborting read/write tasks.
    pub fn disconnect(&self) {
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Start the read task for this socket.
    pub(crate) fn spawn_reader<R>(self: &Arc<Self>, reader: R, registry: Arc<SocketRegistry>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(Arc::clone(self).read_loop(reader, registry));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Read loop: decode frames, reassemble, dispatch.
    ///
    /// Always ends by removing the socket from the registry.
    async fn read_loop<R>(self: Arc<Self>, mut reader: R, registry: Arc<SocketRegistry>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut decoder = FrameDecoder::new();
        let mut reassembler = Reassembler::new(registry.max_message_size());
        let mut buf = vec![0u8; 64 * 1024]; // 64KB read buffer

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("[Socket] Client disconnected: {}", self.id);
                    break;
                }
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            self.handle_frame(frame, &mut reassembler, &registry);
                        }
                    }
                    Err(e) => {
                        log::error!("[Socket] Frame decode error for {}: {e}", self.id);
                        registry.report_error(&self, format!("Frame decode error: {e}"));
                        break;
                    }
                },
                Err(e) => {
                    log::error!("[Socket] Read error for {}: {e}", self.id);
                    registry.report_error(&self, format!("Read error: {e}"));
                    break;
                }
            }
        }

        if reassembler.open_buffers() > 0 {
            log::debug!(
                "[Socket] Abandoning {} partial message(s) for {}",
                reassembler.open_buffers(),
                self.id
            );
        }
        registry.remove(&self.id);
    }

    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        reassembler: &mut Reassembler,
        registry: &Arc<SocketRegistry>,
    ) {
        match frame {
            Frame::Event(message) if message.event == EVENT_HANDSHAKE => {
                self.handle_handshake_echo(message.data, registry);
            }
            Frame::Event(message) => {
                log::warn!("[Socket] {} sent unexpected event '{}'", self.id, message.event);
            }
            Frame::Chunk { event, envelope } => {
                self.handle_chunk(event, envelope, reassembler, registry);
            }
            // Broadcasts only flow server → client
            Frame::Broadcast { .. } => {
                log::warn!("[Socket] Client {} sent unexpected broadcast frame", self.id);
            }
        }
    }

    fn handle_handshake_echo(&self, data: serde_json::Value, registry: &SocketRegistry) {
        let echo: Handshake = match serde_json::from_value(data) {
            Ok(echo) => echo,
            Err(e) => {
                log::warn!("[Socket] Bad handshake from {}: {e}", self.id);
                return;
            }
        };
        let previous = self.session();
        if echo.session_id != previous.id() {
            log::info!("[Socket] {} resuming session {}", self.id, echo.session_id);
            self.bind_session(registry.sessions().get_instance(&echo.session_id));
            registry.release_session(previous.id());
        }
    }

    fn handle_chunk(
        self: &Arc<Self>,
        event: String,
        envelope: ChunkEnvelope,
        reassembler: &mut Reassembler,
        registry: &Arc<SocketRegistry>,
    ) {
        let key = envelope.key.clone();
        match reassembler.accept(envelope) {
            Ok(ChunkStatus::Pending(progress)) => self.send_progress(&key, progress),
            Ok(ChunkStatus::Duplicate(_) | ChunkStatus::Discarded) => {}
            Ok(ChunkStatus::Complete { progress, bytes }) => {
                self.send_progress(&key, progress);
                match codec::decode::<serde_json::Value>(&bytes) {
                    Ok(payload) => dispatch::dispatch(registry, Arc::clone(self), event, key, payload),
                    Err(e) => self.respond_error(&event, &key, RpcError::invalid_payload(&event, e)),
                }
            }
            Err(e) => {
                log::warn!("[Socket] Rejecting '{event}' ({key}) from {}: {e}", self.id);
                self.respond_error(&event, &key, e.into());
            }
        }
    }

    fn send_progress(&self, key: &str, progress: Progress) {
        match serde_json::to_value(progress) {
            Ok(data) => {
                self.send_frame(&Frame::event(progress_channel(key), data));
            }
            Err(e) => log::warn!("[Socket] Failed to encode progress: {e}"),
        }
    }

    /// Write loop: receives encoded frames and writes to the transport.
    async fn write_loop<W>(id: String, mut writer: W, mut frame_rx: UnboundedReceiver<Vec<u8>>)
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(data) = frame_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                log::error!("[Socket] Write error for {}: {e}", id);
                break;
            }
        }
    }
}

/// Generate a unique socket ID using a monotonic counter + random suffix.
pub(crate) fn generate_socket_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("socket:{seq:x}{rand:04x}")
}
