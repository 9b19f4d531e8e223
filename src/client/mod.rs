//! Client half: connection lifecycle, request/response correlation, and
//! broadcast subscriptions.
//!
//! [`Client`] is a cheap handle over shared state. Every request gets a
//! fresh correlation key and a timer; the response, a reassembly failure,
//! or the timer settles it, whichever removes it from the pending table
//! first.
//!
//! ```ignore
//! let client = Client::new(config);
//! client.connect()?;
//! let pong = client.execute("ping", &json!(null), RequestOptions::new()).await?;
//! ```

mod connection;
mod requests;
mod transport;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use connection::ConnectionState;
pub use requests::{ProgressCallback, RequestOptions, ResponseCallback};

use crate::config::Config;
use crate::constants::{progress_key, EVENT_ERROR, EVENT_HANDSHAKE, EVENT_STATE};
use crate::error::{ProtocolError, RpcError};
use crate::listeners::{fire_all, Listener, ListenerRegistry};
use crate::protocol::{generate_key, ChunkEnvelope, Handshake, Progress, ResponseEnvelope, RpcEvent};
use crate::socket::codec::{self, ChunkStatus, Reassembler};
use crate::socket::framing::Frame;
use connection::Connection;
use requests::{PendingRequest, RequestRegistry};

/// Argument passed to client listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// New connection state, fired on `state`.
    State(ConnectionState),
    /// Transport-level failure, fired on `error`. Does not change state.
    Error(String),
    /// Server broadcast, fired on its event name.
    Broadcast(ResponseEnvelope),
}

/// Mutable client state, guarded by one lock.
#[derive(Debug)]
struct ClientState {
    connection: Connection,
    requests: RequestRegistry,
    reassembler: Reassembler,
    /// Session from the first handshake; echoed on every reconnect.
    session_id: Option<String>,
    socket_id: Option<String>,
    /// Server-advertised message cap.
    remote_max: Option<usize>,
}

/// Shared core behind [`Client`] handles and the transport driver.
pub(crate) struct ClientCore {
    config: Config,
    state: Mutex<ClientState>,
    listeners: Mutex<ListenerRegistry<ClientEvent>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCore")
            .field("socket_path", &self.config.socket_path)
            .field("state", &self.lock().connection.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
    }
}

impl ClientCore {
    fn new(config: Config) -> Self {
        let max_message_size = config.max_message_size;
        Self {
            config,
            state: Mutex::new(ClientState {
                connection: Connection::new(),
                requests: RequestRegistry::new(),
                reassembler: Reassembler::new(max_message_size),
                session_id: None,
                socket_id: None,
                remote_max: None,
            }),
            listeners: Mutex::new(ListenerRegistry::new()),
            driver: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, event: &str, args: &ClientEvent) {
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(event);
        fire_all(&snapshot, args);
    }

    fn fire_state(&self, state: ConnectionState) {
        log::debug!("[Client] State → {state}");
        self.fire(EVENT_STATE, &ClientEvent::State(state));
    }

    /// Transport connected: resume the session if we have one, flush the queue.
    pub(crate) fn on_transport_connected(&self, transport: UnboundedSender<Vec<u8>>) {
        let changed = {
            let mut state = self.lock();
            let preamble = state.session_id.as_deref().and_then(|id| match handshake_echo(id) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    log::warn!("[Client] Failed to encode session resume: {e}");
                    None
                }
            });
            state.connection.transport_connected(transport, preamble)
        };
        if let Some(new_state) = changed {
            self.fire_state(new_state);
        }
    }

    /// Transport dropped. Partial responses are abandoned; pending requests
    /// keep waiting for their timers.
    pub(crate) fn on_transport_disconnected(&self) {
        let changed = {
            let mut state = self.lock();
            if state.reassembler.open_buffers() > 0 {
                log::debug!(
                    "[Client] Abandoning {} partial response(s)",
                    state.reassembler.open_buffers()
                );
            }
            state.reassembler = Reassembler::new(self.config.max_message_size);
            state.socket_id = None;
            state.connection.transport_disconnected()
        };
        if let Some(new_state) = changed {
            self.fire_state(new_state);
        }
    }

    pub(crate) fn report_error(&self, message: String) {
        log::warn!("[Client] {message}");
        self.fire(EVENT_ERROR, &ClientEvent::Error(message));
    }

    /// Route one inbound frame.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Event(message) if message.event == EVENT_HANDSHAKE => {
                self.handle_handshake(message.data);
            }
            Frame::Event(message) => match progress_key(&message.event) {
                Some(key) => self.handle_progress(key, message.data),
                None => log::debug!("[Client] Ignoring event '{}'", message.event),
            },
            Frame::Chunk { event, envelope } => self.handle_chunk(&event, envelope, false),
            Frame::Broadcast { event, envelope } => self.handle_chunk(&event, envelope, true),
        }
    }

    fn handle_handshake(&self, data: Value) {
        let handshake: Handshake = match serde_json::from_value(data) {
            Ok(handshake) => handshake,
            Err(e) => {
                log::warn!("[Client] Bad handshake: {e}");
                return;
            }
        };

        let mut state = self.lock();
        state.remote_max = handshake.max_message_size;
        state.socket_id = handshake.socket_id;
        let session_id = state
            .session_id
            .get_or_insert_with(|| handshake.session_id.clone())
            .clone();
        match handshake_echo(&session_id) {
            Ok(frame) => {
                state.connection.send_now(frame);
            }
            Err(e) => log::warn!("[Client] Failed to encode handshake echo: {e}"),
        }
        log::info!(
            "[Client] Handshake: session {session_id}, max message {:?}",
            state.remote_max
        );
    }

    fn handle_progress(&self, key: &str, data: Value) {
        let Some(on_progress) = self.lock().requests.progress_callback(key) else {
            return;
        };
        match serde_json::from_value::<Progress>(data) {
            Ok(progress) => on_progress(progress),
            Err(e) => log::warn!("[Client] Bad progress for {key}: {e}"),
        }
    }

    fn handle_chunk(&self, event: &str, envelope: ChunkEnvelope, broadcast: bool) {
        let key = envelope.key.clone();
        let status = self.lock().reassembler.accept(envelope);

        match status {
            Ok(ChunkStatus::Complete { bytes, .. }) => match codec::decode::<ResponseEnvelope>(&bytes) {
                Ok(response) if broadcast => self.fire(event, &ClientEvent::Broadcast(response)),
                Ok(response) => {
                    let key = response.key.clone();
                    self.settle(event, &key, response.into_result());
                }
                Err(e) => {
                    log::warn!("[Client] Undecodable '{event}' message {key}: {e}");
                    if !broadcast {
                        self.settle(event, &key, Err(RpcError::invalid_payload(event, e)));
                    }
                }
            },
            Ok(_) => {}
            Err(e) => {
                log::warn!("[Client] Reassembly failed for '{event}' ({key}): {e}");
                if !broadcast {
                    self.settle(event, &key, Err(e.into()));
                }
            }
        }
    }

    /// Deliver `result` to the request for `key`, if it is still pending.
    fn settle(&self, event: &str, key: &str, result: Result<Value, RpcError>) {
        let Some(request) = self.lock().requests.take(key) else {
            log::debug!("[Client] Ignoring late '{event}' response for {key}");
            return;
        };
        request.settle(result);
    }

    fn expire(&self, key: &str) {
        let Some(mut request) = self.lock().requests.take(key) else {
            return;
        };
        // Running inside the timer itself.
        request.timer = None;
        log::debug!(
            "[Client] '{}' ({key}) timed out after {:?}",
            request.event,
            request.created_at.elapsed()
        );
        let envelope = ResponseEnvelope::failure(key, RpcError::timeout(&request.event));
        request.settle(envelope.into_result());
    }
}

fn handshake_echo(session_id: &str) -> anyhow::Result<Vec<u8>> {
    let echo = Handshake {
        session_id: session_id.to_string(),
        socket_id: None,
        max_message_size: None,
    };
    Frame::event(EVENT_HANDSHAKE, serde_json::to_value(echo)?).encode()
}

fn encode_request(event: &str, key: &str, bytes: &[u8], chunk_size: usize) -> anyhow::Result<Vec<Vec<u8>>> {
    codec::split(key, bytes, chunk_size)?
        .into_iter()
        .map(|envelope| {
            Frame::Chunk {
                event: event.to_string(),
                envelope,
            }
            .encode()
        })
        .collect()
}

async fn expire_after(core: std::sync::Weak<ClientCore>, key: String, timeout: std::time::Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(core) = core.upgrade() {
        core.expire(&key);
    }
}

/// Handle to a client connection. Clones share one connection.
#[derive(Debug, Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Create an unconnected client.
    pub fn new(config: Config) -> Self {
        Self {
            core: Arc::new(ClientCore::new(config)),
        }
    }

    /// Start the transport driver for `config.socket_path`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::AlreadyConnected`] unless the state is still `None`.
    pub fn connect(&self) -> Result<(), ProtocolError> {
        let new_state = self.core.lock().connection.begin_connect()?;
        self.core.fire_state(new_state);

        let driver = tokio::spawn(transport::run(
            Arc::downgrade(&self.core),
            self.core.config.socket_path.clone(),
            self.core.config.reconnect_interval(),
        ));
        *self.core.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
        Ok(())
    }

    /// Stop the transport driver.
    pub fn close(&self) {
        if let Some(driver) = self
            .core
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        self.core.on_transport_disconnected();
    }

    /// Subscribe to `state`, `error`, or a broadcast event name.
    pub fn on(&self, event: &str, listener: Listener<ClientEvent>) -> &Self {
        self.core
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_listener(event, listener);
        self
    }

    /// Unsubscribe a listener previously passed to [`Client::on`].
    pub fn off(&self, event: &str, listener: &Listener<ClientEvent>) -> &Self {
        self.core
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_listener(event, listener);
        self
    }

    /// Send a request; `callback` runs exactly once with the outcome.
    ///
    /// A payload over the effective message cap fails immediately with
    /// `ERR_PAYLOAD_TOO_LARGE` and nothing is sent. Must be called from
    /// within a tokio runtime (the timeout is a spawned timer).
    pub fn request<P, F>(&self, event: &str, payload: &P, options: RequestOptions, callback: F)
    where
        P: Serialize + ?Sized,
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        let bytes = match codec::encode(payload) {
            Ok(bytes) => bytes,
            Err(e) => return callback(Err(RpcError::invalid_payload(event, e))),
        };

        let remote_max = self.core.lock().remote_max;
        let max = codec::effective_max(self.core.config.max_message_size, remote_max);
        if let Err(e) = codec::check_size(bytes.len(), max) {
            log::warn!("[Client] Refusing to send '{event}': {e}");
            return callback(Err(e.into()));
        }

        let key = generate_key();
        let frames = match encode_request(event, &key, &bytes, self.core.config.chunk_size) {
            Ok(frames) => frames,
            Err(e) => {
                return callback(Err(RpcError::internal(format!(
                    "Failed to encode '{event}' request: {e}"
                ))))
            }
        };

        let timeout = options.timeout.unwrap_or_else(|| self.core.config.request_timeout());
        let mut state = self.core.lock();
        // Spawned under the lock so the timer cannot look up the key before it exists.
        let timer = tokio::spawn(expire_after(Arc::downgrade(&self.core), key.clone(), timeout));
        state.requests.insert(
            key.clone(),
            PendingRequest {
                event: event.to_string(),
                created_at: Instant::now(),
                timer: Some(timer),
                callback: Box::new(callback),
                on_progress: options.on_progress,
            },
        );
        log::debug!(
            "[Client] '{event}' ({key}): {} byte(s) in {} chunk(s)",
            bytes.len(),
            frames.len()
        );
        state.connection.emit(frames);
    }

    /// [`Client::request`] as a future.
    pub async fn execute<P>(&self, event: &str, payload: &P, options: RequestOptions) -> Result<Value, RpcError>
    where
        P: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        self.request(event, payload, options, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| Err(RpcError::internal(format!("Request '{event}' was dropped"))))
    }

    /// Typed request for an [`RpcEvent`].
    pub async fn call<E: RpcEvent>(&self, request: &E::Request) -> Result<E::Response, RpcError> {
        let value = self.execute(E::NAME, request, RequestOptions::new()).await?;
        serde_json::from_value(value).map_err(|e| RpcError::invalid_payload(E::NAME, e))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.lock().connection.state()
    }

    /// Session id from the server's first handshake.
    pub fn session_id(&self) -> Option<String> {
        self.core.lock().session_id.clone()
    }

    /// Server-assigned id of the current socket.
    pub fn socket_id(&self) -> Option<String> {
        self.core.lock().socket_id.clone()
    }

    /// Requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.core.lock().requests.len()
    }

    /// Frames queued while not connected.
    pub fn queued_frames(&self) -> usize {
        self.core.lock().connection.queued()
    }

    /// The client's configuration.
    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::constants::{ERR_PAYLOAD_TOO_LARGE, ERR_REASSEMBLY, ERR_TIMEOUT};
    use crate::listeners::listener;
    use crate::socket::framing::FrameDecoder;

    fn client_with(chunk_size: usize, max_message_size: usize) -> Client {
        Client::new(Config {
            chunk_size,
            max_message_size,
            ..Config::default()
        })
    }

    fn attach(client: &Client) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        client.core.on_transport_connected(tx);
        rx
    }

    /// Every frame written so far.
    fn written(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            frames.extend(decoder.feed(&bytes).unwrap());
        }
        frames
    }

    fn chunk_keys(frames: &[Frame]) -> Vec<(String, String)> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Chunk { event, envelope } => Some((event.clone(), envelope.key.clone())),
                _ => None,
            })
            .collect()
    }

    fn response_frames(event: &str, key: &str, result: Result<Value, RpcError>, chunk_size: usize) -> Vec<Frame> {
        let bytes = codec::encode(&ResponseEnvelope::from_result(key, result)).unwrap();
        codec::split(key, &bytes, chunk_size)
            .unwrap()
            .into_iter()
            .map(|envelope| Frame::Chunk {
                event: event.to_string(),
                envelope,
            })
            .collect()
    }

    fn recorder() -> (
        Arc<Mutex<Vec<Result<Value, RpcError>>>>,
        impl FnOnce(Result<Value, RpcError>) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |r: Result<Value, RpcError>| sink.lock().unwrap().push(r))
    }

    #[tokio::test]
    async fn test_timeout_fires_exactly_once() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);
        let (seen, callback) = recorder();

        client.request(
            "slow",
            &json!(null),
            RequestOptions::new().timeout(Duration::from_millis(50)),
            callback,
        );
        let (_, key) = chunk_keys(&written(&mut rx)).remove(0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            let err = seen[0].as_ref().unwrap_err();
            assert_eq!(err.code, ERR_TIMEOUT);
            assert_eq!(err.message, "The request 'slow' timed out.");
            assert_eq!(err.status_code, None);
        }

        for frame in response_frames("slow", &key, Ok(json!("late")), 1024) {
            client.core.handle_frame(frame);
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_response_cancels_timeout() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);
        let (seen, callback) = recorder();

        client.request(
            "fast",
            &json!(1),
            RequestOptions::new().timeout(Duration::from_millis(50)),
            callback,
        );
        let (_, key) = chunk_keys(&written(&mut rx)).remove(0);
        for frame in response_frames("fast", &key, Ok(json!(2)), 1024) {
            client.core.handle_frame(frame);
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap(), &json!(2));
    }

    #[tokio::test]
    async fn test_requests_queue_while_disconnected_then_flush_in_order() {
        let client = client_with(1024, 1 << 20);
        let mut first = attach(&client);
        client.core.handle_frame(Frame::event(
            EVENT_HANDSHAKE,
            json!({"sessionId": "s1", "socketId": "socket:1", "maxMessageSize": 1024}),
        ));
        written(&mut first);
        client.core.on_transport_disconnected();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.request("first", &json!(1), RequestOptions::new(), |_| {});
        client.request("second", &json!(2), RequestOptions::new(), |_| {});
        assert_eq!(client.queued_frames(), 2);
        assert!(written(&mut first).is_empty());

        let mut second = attach(&client);
        let frames = written(&mut second);
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            Frame::Event(msg) => {
                assert_eq!(msg.event, EVENT_HANDSHAKE);
                assert_eq!(msg.data, json!({"sessionId": "s1"}));
            }
            other => panic!("expected session resume first, got {other:?}"),
        }
        let events: Vec<String> = chunk_keys(&frames).into_iter().map(|(e, _)| e).collect();
        assert_eq!(events, vec!["first", "second"]);
        assert_eq!(client.queued_frames(), 0);
        assert!(written(&mut second).is_empty());
    }

    #[tokio::test]
    async fn test_oversize_payload_fails_fast_without_emitting() {
        let client = client_with(4, 8);
        let mut rx = attach(&client);
        let (seen, callback) = recorder();

        // 10 encoded bytes against an 8-byte cap
        client.request("big", &json!("xxxxxxxx"), RequestOptions::new(), callback);

        let err = seen.lock().unwrap().remove(0).unwrap_err();
        assert_eq!(err.code, ERR_PAYLOAD_TOO_LARGE);
        assert_eq!(err.status_code, Some(413));
        assert!(written(&mut rx).is_empty());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_advertised_cap_applies() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);
        client.core.handle_frame(Frame::event(
            EVENT_HANDSHAKE,
            json!({"sessionId": "s1", "maxMessageSize": 4}),
        ));
        written(&mut rx);

        let err = client
            .execute("big", &json!("xxxxxxxx"), RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ERR_PAYLOAD_TOO_LARGE);
        assert!(written(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_request_split_into_chunks_reports_progress() {
        let client = client_with(4, 1 << 20);
        let mut rx = attach(&client);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);

        client.request(
            "upload",
            &json!("xxxxxxxx"),
            RequestOptions::new().on_progress(move |p| sink.lock().unwrap().push(p)),
            |_| {},
        );

        let frames = written(&mut rx);
        let lens: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                Frame::Chunk { envelope, .. } => {
                    assert_eq!(envelope.byte_length, 10);
                    envelope.data.len()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(lens, vec![4, 4, 2]);

        let (_, key) = chunk_keys(&frames).remove(0);
        for done in 1..=3 {
            client.core.handle_frame(Frame::event(
                format!("{key}~progress"),
                json!({"total": 3, "done": done}),
            ));
        }
        assert_eq!(
            *progress.lock().unwrap(),
            vec![
                Progress { total: 3, done: 1 },
                Progress { total: 3, done: 2 },
                Progress { total: 3, done: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_interleaved_responses_resolve_independently() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);

        let a = tokio::spawn({
            let client = client.clone();
            async move { client.execute("a", &json!("A"), RequestOptions::new()).await }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.execute("b", &json!("B"), RequestOptions::new()).await }
        });

        let mut keys = Vec::new();
        while keys.len() < 2 {
            tokio::task::yield_now().await;
            keys.extend(chunk_keys(&written(&mut rx)));
        }

        let streams: Vec<Vec<Frame>> = keys
            .iter()
            .map(|(event, key)| response_frames(event, key, Ok(json!(format!("{event}-reply"))), 3))
            .collect();
        let longest = streams.iter().map(Vec::len).max().unwrap();
        for i in 0..longest {
            for stream in streams.iter().rev() {
                if let Some(frame) = stream.get(i) {
                    client.core.handle_frame(frame.clone());
                }
            }
        }

        assert_eq!(a.await.unwrap().unwrap(), json!("a-reply"));
        assert_eq!(b.await.unwrap().unwrap(), json!("b-reply"));
    }

    #[tokio::test]
    async fn test_reassembly_failure_fails_pending_request() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);
        let (seen, callback) = recorder();
        client.request("x", &json!(1), RequestOptions::new(), callback);
        let (_, key) = chunk_keys(&written(&mut rx)).remove(0);

        client.core.handle_frame(Frame::Chunk {
            event: "x".into(),
            envelope: ChunkEnvelope {
                key,
                size: 1,
                index: 0,
                byte_length: 99,
                data: b"{}".to_vec(),
            },
        });

        let err = seen.lock().unwrap().remove(0).unwrap_err();
        assert_eq!(err.code, ERR_REASSEMBLY);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_listener_not_pending() {
        let client = client_with(1024, 1 << 20);
        let _rx = attach(&client);
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        client.on(
            "news",
            listener(move |e: &ClientEvent| sink.lock().unwrap().push(e.clone())),
        );

        for frame in response_frames("news", "bkey", Ok(json!({"headline": "hi"})), 4) {
            let Frame::Chunk { event, envelope } = frame else { unreachable!() };
            client.core.handle_frame(Frame::Broadcast { event, envelope });
        }
        // A response nobody is waiting for is dropped quietly.
        for frame in response_frames("news", "stale", Ok(json!(0)), 4) {
            client.core.handle_frame(frame);
        }

        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        match &got[0] {
            ClientEvent::Broadcast(envelope) => {
                assert_eq!(envelope.data, Some(json!({"headline": "hi"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_echo_keeps_first_session() {
        let client = client_with(1024, 1 << 20);
        let mut rx = attach(&client);

        client.core.handle_frame(Frame::event(
            EVENT_HANDSHAKE,
            json!({"sessionId": "s1", "socketId": "socket:a"}),
        ));
        assert_eq!(client.session_id().as_deref(), Some("s1"));
        assert_eq!(client.socket_id().as_deref(), Some("socket:a"));

        client.core.handle_frame(Frame::event(
            EVENT_HANDSHAKE,
            json!({"sessionId": "s2", "socketId": "socket:b"}),
        ));
        let echoes: Vec<Value> = written(&mut rx)
            .into_iter()
            .filter_map(|f| match f {
                Frame::Event(msg) if msg.event == EVENT_HANDSHAKE => Some(msg.data),
                _ => None,
            })
            .collect();
        assert_eq!(echoes, vec![json!({"sessionId": "s1"}), json!({"sessionId": "s1"})]);
        assert_eq!(client.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_state_events_and_double_connect() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Client::new(Config {
            reconnect_interval_ms: 20,
            ..Config::default().with_socket_path(dir.path().join("missing.sock"))
        });
        let states = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&states);
        let e = Arc::clone(&errors);
        client.on(
            EVENT_STATE,
            listener(move |ev: &ClientEvent| {
                if let ClientEvent::State(state) = ev {
                    s.lock().unwrap().push(*state);
                }
            }),
        );
        client.on(
            EVENT_ERROR,
            listener(move |_: &ClientEvent| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.connect().unwrap();
        assert_eq!(client.connect(), Err(ProtocolError::AlreadyConnected));

        tokio::time::timeout(Duration::from_secs(2), async {
            while errors.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Failed dials report errors without leaving Connecting.
        assert_eq!(client.state(), ConnectionState::Connecting);

        let _rx = attach(&client);
        client.core.on_transport_disconnected();
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        client.close();
    }
}
