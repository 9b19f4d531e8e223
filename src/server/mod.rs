//! Server half: accept loop, socket registry, dispatcher, capability wrappers.
//!
//! ```text
//! UnixListener ─accept─► SocketRegistry::add ─► Socket (read/write tasks)
//!                                                  │ complete message
//!                                                  ▼
//!                                   dispatch ─► wrappers ─► handler
//! ```

pub mod capabilities;
pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

pub use capabilities::{broadcast, not_socket_method, require_auth, BroadcastOptions};
pub use connection::Socket;
pub use dispatch::{typed, Handler, HandlerContext, HandlerGroup, HandlerResult, Next, Router};
pub use registry::{SocketEvent, SocketFilter, SocketRegistry};
pub use session::{MemorySession, MemorySessionStore, Session, SessionStore, User};

/// sun_path is 104 on macOS, 108 on Linux; use conservative limit
const MAX_SOCKET_PATH: usize = 104;

/// Unix domain socket server.
///
/// Binds a `UnixListener` and spawns an accept loop that hands every
/// connection to the [`SocketRegistry`].
#[derive(Debug)]
pub struct SocketServer {
    /// Path to the socket file (for cleanup).
    socket_path: PathBuf,
    /// Shared connection registry.
    registry: Arc<SocketRegistry>,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl SocketServer {
    /// Start the socket server at the given path.
    ///
    /// Removes any stale socket file, binds the listener, sets permissions
    /// to 0600, and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn start(socket_path: PathBuf, registry: Arc<SocketRegistry>) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        // Owner-only (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("Socket server listening on {}", socket_path.display());

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&registry),
            socket_path.clone(),
        ));

        Ok(Self {
            socket_path,
            registry,
            accept_handle,
        })
    }

    /// Accept loop — runs as a tokio task.
    async fn accept_loop(listener: UnixListener, registry: Arc<SocketRegistry>, socket_path: PathBuf) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    registry.add(stream);
                }
                Err(e) => {
                    // Socket file gone means we are shutting down
                    if !socket_path.exists() {
                        log::info!("[Socket] Socket file removed, stopping accept loop");
                        break;
                    }
                    log::error!("[Socket] Accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// The registry serving this server's connections.
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, drop every connection, and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        self.registry.shutdown();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("[Socket] Socket file cleanup: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Raw wire peer over an in-memory duplex, for server unit tests.

    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::{MemorySessionStore, Router, Socket, SocketRegistry};
    use crate::config::Config;
    use crate::protocol::{EventMessage, Handshake, ResponseEnvelope};
    use crate::socket::codec::{self, ChunkStatus, Reassembler};
    use crate::socket::framing::{Frame, FrameDecoder};

    pub(crate) const WAIT: Duration = Duration::from_secs(2);

    /// A registry with `router` and small chunks.
    pub(crate) fn registry_with(router: Router, chunk_size: usize) -> Arc<SocketRegistry> {
        registry_from(
            &Config {
                chunk_size,
                ..Config::default()
            },
            router,
        )
    }

    pub(crate) fn registry_from(config: &Config, router: Router) -> Arc<SocketRegistry> {
        SocketRegistry::new(config, router, Arc::new(MemorySessionStore::new()))
    }

    /// A decoded message as seen by the client end.
    #[derive(Debug)]
    pub(crate) struct Received {
        pub event: String,
        pub envelope: ResponseEnvelope,
        pub broadcast: bool,
    }

    pub(crate) struct RawPeer {
        stream: DuplexStream,
        decoder: FrameDecoder,
        frames: VecDeque<Frame>,
        reassembler: Reassembler,
        pub handshake: Handshake,
        pub events: Vec<EventMessage>,
    }

    /// Attach a raw peer to `registry` and read its handshake.
    pub(crate) async fn connect(registry: &Arc<SocketRegistry>) -> (Arc<Socket>, RawPeer) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let socket = registry.add(server);
        let mut peer = RawPeer {
            stream: client,
            decoder: FrameDecoder::new(),
            frames: VecDeque::new(),
            reassembler: Reassembler::new(usize::MAX),
            handshake: Handshake {
                session_id: String::new(),
                socket_id: None,
                max_message_size: None,
            },
            events: Vec::new(),
        };
        match peer.next_frame().await {
            Frame::Event(msg) if msg.event == "handshake" => {
                peer.handshake = serde_json::from_value(msg.data).unwrap();
            }
            other => panic!("expected handshake, got {other:?}"),
        }
        (socket, peer)
    }

    impl RawPeer {
        pub(crate) async fn send(&mut self, frame: &Frame) {
            self.stream.write_all(&frame.encode().unwrap()).await.unwrap();
        }

        /// Send `payload` as a chunked request.
        pub(crate) async fn request(&mut self, event: &str, key: &str, payload: &Value, chunk_size: usize) {
            let bytes = codec::encode(payload).unwrap();
            for envelope in codec::split(key, &bytes, chunk_size).unwrap() {
                self.send(&Frame::Chunk {
                    event: event.to_string(),
                    envelope,
                })
                .await;
            }
        }

        pub(crate) async fn next_frame(&mut self) -> Frame {
            tokio::time::timeout(WAIT, self.read_frame())
                .await
                .expect("Timed out waiting for frame")
        }

        async fn read_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.frames.pop_front() {
                    return frame;
                }
                let mut buf = [0u8; 4096];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed the stream");
                self.frames.extend(self.decoder.feed(&buf[..n]).unwrap());
            }
        }

        /// Next complete response or broadcast; event frames are collected.
        pub(crate) async fn recv(&mut self) -> Received {
            loop {
                let (event, envelope, broadcast) = match self.next_frame().await {
                    Frame::Event(msg) => {
                        self.events.push(msg);
                        continue;
                    }
                    Frame::Chunk { event, envelope } => (event, envelope, false),
                    Frame::Broadcast { event, envelope } => (event, envelope, true),
                };
                if let ChunkStatus::Complete { bytes, .. } = self.reassembler.accept(envelope).unwrap() {
                    return Received {
                        event,
                        envelope: codec::decode(&bytes).unwrap(),
                        broadcast,
                    };
                }
            }
        }

        /// Drop the stream, as a crashed client would.
        pub(crate) fn close(self) {
            drop(self.stream);
        }

        /// Assert nothing but event frames arrives within `window`.
        pub(crate) async fn expect_silence(&mut self, window: Duration) {
            if let Ok(received) = tokio::time::timeout(window, self.recv()).await {
                panic!("expected silence, got {received:?}");
            }
        }
    }
}
