//! Live connection set, lifecycle events, and broadcast fan-out.
//!
//! The membership map is the one structure shared across connections, so it
//! sits behind an `RwLock`: connects and disconnects take the write side,
//! broadcasts iterate a cloned snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::connection::{generate_socket_id, Socket};
use super::dispatch::Router;
use super::session::SessionStore;
use crate::config::Config;
use crate::constants::{EVENT_CONNECTION, EVENT_DISCONNECT, EVENT_ERROR};
use crate::listeners::{fire_all, Listener, ListenerRegistry};
use crate::protocol::{generate_key, ResponseEnvelope};
use crate::socket::codec;
use crate::socket::framing::Frame;

/// Predicate deciding whether a socket receives a broadcast.
pub type SocketFilter = Arc<dyn Fn(&Socket) -> bool + Send + Sync>;

/// Argument passed to `connection` / `disconnect` / `error` listeners.
#[derive(Debug, Clone)]
pub struct SocketEvent {
    /// Socket the event concerns.
    pub socket: Arc<Socket>,
    /// Error description for `error` events.
    pub error: Option<String>,
}

/// Tracks every live connection of one server.
pub struct SocketRegistry {
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    listeners: Mutex<ListenerRegistry<SocketEvent>>,
    router: Router,
    sessions: Arc<dyn SessionStore>,
    chunk_size: usize,
    max_message_size: usize,
}

impl std::fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("sockets", &self.len())
            .field("events", &self.router.events())
            .finish_non_exhaustive()
    }
}

impl SocketRegistry {
    /// Create a registry serving `router`'s handlers.
    pub fn new(config: &Config, router: Router, sessions: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            sockets: RwLock::new(HashMap::new()),
            listeners: Mutex::new(ListenerRegistry::new()),
            router,
            sessions,
            chunk_size: config.chunk_size,
            max_message_size: config.max_message_size,
        })
    }

    /// Subscribe to `connection`, `disconnect`, or `error`.
    pub fn on(&self, event: &str, listener: Listener<SocketEvent>) -> &Self {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_listener(event, listener);
        self
    }

    /// Unsubscribe a listener previously passed to [`SocketRegistry::on`].
    pub fn off(&self, event: &str, listener: &Listener<SocketEvent>) -> &Self {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_listener(event, listener);
        self
    }

    fn fire(&self, event: &str, args: &SocketEvent) {
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(event);
        fire_all(&snapshot, args);
    }

    /// Take ownership of a new transport connection.
    ///
    /// Binds a fresh session, registers the socket, fires `connection`,
    /// sends the handshake, and starts the read task.
    pub fn add<S>(self: &Arc<Self>, stream: S) -> Arc<Socket>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = self.sessions.get_instance(&self.sessions.generate_id());
        let socket = Socket::new(generate_socket_id(), writer, session, self.chunk_size);

        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(socket.id().to_string(), Arc::clone(&socket));
        log::info!("[Socket] Client connected: {}", socket.id());

        self.fire(
            EVENT_CONNECTION,
            &SocketEvent {
                socket: Arc::clone(&socket),
                error: None,
            },
        );
        socket.send_handshake(self.max_message_size);
        socket.spawn_reader(reader, Arc::clone(self));
        socket
    }

    /// Forget a socket and fire `disconnect`. No-op for unknown ids.
    pub fn remove(&self, id: &str) -> Option<Arc<Socket>> {
        let removed = self
            .sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(socket) = &removed {
            self.release_session(socket.session().id());
            self.fire(
                EVENT_DISCONNECT,
                &SocketEvent {
                    socket: Arc::clone(socket),
                    error: None,
                },
            );
        }
        removed
    }

    /// Tell the session store `session_id` is free, unless a live socket
    /// still holds it.
    pub(crate) fn release_session(&self, session_id: &str) {
        let in_use = self
            .sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|socket| socket.session().id() == session_id);
        if !in_use {
            self.sessions.release(session_id);
        }
    }

    /// Fire `error` for a transport failure on `socket`.
    pub(crate) fn report_error(&self, socket: &Arc<Socket>, message: String) {
        self.fire(
            EVENT_ERROR,
            &SocketEvent {
                socket: Arc::clone(socket),
                error: Some(message),
            },
        );
    }

    /// Look up a live socket.
    pub fn get(&self, id: &str) -> Option<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot of every live socket.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.sockets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no socket is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `{ data, _key }` on `event` to every matching socket.
    ///
    /// Skips `origin` unless `include_self`, and any socket `filter` rejects.
    /// The message is encoded and chunked once. Returns the recipient count.
    pub fn broadcast(
        &self,
        event: &str,
        data: Value,
        origin: Option<&str>,
        include_self: bool,
        filter: Option<&SocketFilter>,
    ) -> usize {
        let frames = match self.encode_broadcast(event, data) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("[Socket] Failed to encode broadcast '{event}': {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for socket in self.sockets() {
            if !include_self && origin == Some(socket.id()) {
                continue;
            }
            if filter.is_some_and(|f| !f(socket.as_ref())) {
                continue;
            }
            if socket.emit_encoded(&frames) {
                delivered += 1;
            }
        }
        log::debug!("[Socket] Broadcast '{event}' to {delivered} socket(s)");
        delivered
    }

    fn encode_broadcast(&self, event: &str, data: Value) -> anyhow::Result<Vec<Vec<u8>>> {
        let envelope = ResponseEnvelope::success(generate_key(), data);
        let bytes = codec::encode(&envelope)?;
        codec::split(&envelope.key, &bytes, self.chunk_size)?
            .into_iter()
            .map(|chunk| {
                Frame::Broadcast {
                    event: event.to_string(),
                    envelope: chunk,
                }
                .encode()
            })
            .collect()
    }

    /// Handler table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Session collaborator.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Advertised cap on inbound message size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Disconnect every socket.
    pub fn shutdown(&self) {
        for socket in self.sockets() {
            socket.disconnect();
            self.remove(socket.id());
        }
    }
}
