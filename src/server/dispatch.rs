//! Handler registration table and dispatcher.
//!
//! A [`Handler`] may answer in three ways, all normalized identically:
//!
//! - **callback**: call [`Next::send`] (possibly later, from another task)
//! - **promise**: resolve its future to `Ok(Some(value))` or `Err(error)`
//! - **throw**: return `Err` synchronously, or panic
//!
//! Exactly one Response Envelope goes out per inbound message. The first
//! path to answer wins; any later attempt is dropped with a warning.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;

use super::connection::Socket;
use super::registry::{SocketFilter, SocketRegistry};
use super::session::{Session, User};
use crate::error::RpcError;
use crate::protocol::{ResponseEnvelope, RpcEvent};

/// What a handler's future resolves to.
///
/// `Ok(None)` means the handler answers (or has answered) through [`Next`].
pub type HandlerResult = Result<Option<Value>, RpcError>;

type HandlerFn = dyn Fn(HandlerContext, Value, Next) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A bound event handler, possibly wrapped by capability wrappers.
#[derive(Clone)]
pub struct Handler {
    func: Arc<HandlerFn>,
    exposed: bool,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("exposed", &self.exposed)
            .finish_non_exhaustive()
    }
}

impl Handler {
    /// Promise-style handler.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(HandlerContext, Value, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |ctx, payload, next| f(ctx, payload, next).boxed()),
            exposed: true,
        }
    }

    /// Callback-style handler: answers only through `next`.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(HandlerContext, Value, Next) + Send + Sync + 'static,
    {
        Self::new(move |ctx, payload, next| {
            f(ctx, payload, next);
            future::ready(Ok(None))
        })
    }

    /// Synchronous handler: returns its value or error immediately.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(HandlerContext, Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Self::new(move |ctx, payload, _next| future::ready(f(ctx, payload).map(Some)))
    }

    /// Invoke the handler.
    pub fn call(&self, ctx: HandlerContext, payload: Value, next: Next) -> BoxFuture<'static, HandlerResult> {
        (self.func)(ctx, payload, next)
    }

    /// Whether the router should build an event binding for this handler.
    pub fn is_exposed(&self) -> bool {
        self.exposed
    }

    /// Rebuild around `inner`, keeping this handler's registration flag.
    pub(crate) fn wrap<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(Handler, HandlerContext, Value, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let inner = self.clone();
        let mut wrapped = Self::new(move |ctx, payload, next| f(inner.clone(), ctx, payload, next));
        wrapped.exposed = self.exposed;
        wrapped
    }

    pub(crate) fn hidden(mut self) -> Self {
        self.exposed = false;
        self
    }
}

/// Typed handler for an [`RpcEvent`]: decodes the request at the boundary
/// and encodes the response.
pub fn typed<E, F, Fut>(f: F) -> Handler
where
    E: RpcEvent + 'static,
    F: Fn(HandlerContext, E::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<E::Response, RpcError>> + Send + 'static,
{
    let f = Arc::new(f);
    Handler::new(move |ctx, payload, _next| {
        let f = Arc::clone(&f);
        async move {
            let request: E::Request =
                serde_json::from_value(payload).map_err(|e| RpcError::invalid_payload(E::NAME, e))?;
            let response = f(ctx, request).await?;
            serde_json::to_value(response)
                .map(Some)
                .map_err(|e| RpcError::internal(format!("Failed to encode '{}' response: {e}", E::NAME)))
        }
    })
}

/// Supplies one group's `(event name, handler)` pairs.
pub trait HandlerGroup {
    /// The explicit registration table for this group.
    fn handlers(&self) -> Vec<(String, Handler)>;
}

/// Event name → handler table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `event`. Handlers marked `not_socket_method` are skipped.
    pub fn register(&mut self, event: impl Into<String>, handler: Handler) -> &mut Self {
        let event = event.into();
        if !handler.is_exposed() {
            log::debug!("[Dispatch] Skipping '{event}': not a socket method");
            return self;
        }
        if self.handlers.insert(event.clone(), handler).is_some() {
            log::warn!("[Dispatch] Handler for '{event}' replaced");
        }
        self
    }

    /// Bind a typed handler under `E::NAME`.
    pub fn on<E, F, Fut>(&mut self, f: F) -> &mut Self
    where
        E: RpcEvent + 'static,
        F: Fn(HandlerContext, E::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E::Response, RpcError>> + Send + 'static,
    {
        self.register(E::NAME, typed::<E, F, Fut>(f))
    }

    /// Register every handler a group supplies.
    pub fn register_group(&mut self, group: &dyn HandlerGroup) -> &mut Self {
        for (event, handler) in group.handlers() {
            self.register(event, handler);
        }
        self
    }

    /// Handler bound to `event`.
    pub fn get(&self, event: &str) -> Option<&Handler> {
        self.handlers.get(event)
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    /// Number of bound events.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no event is bound.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything a handler can see about the message it is serving.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    socket: Arc<Socket>,
    registry: Arc<SocketRegistry>,
    event: String,
    key: String,
}

impl HandlerContext {
    pub(crate) fn new(socket: Arc<Socket>, registry: Arc<SocketRegistry>, event: String, key: String) -> Self {
        Self {
            socket,
            registry,
            event,
            key,
        }
    }

    /// Originating connection.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// The connection's session.
    pub fn session(&self) -> Arc<dyn Session> {
        self.socket.session()
    }

    /// The authenticated user, if any.
    pub fn user(&self) -> Option<User> {
        self.socket.session().user()
    }

    /// Registry of all live connections.
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    /// Event being served.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Correlation key of the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Broadcast `data` on `event` to every other matching connection.
    pub fn broadcast(&self, event: &str, data: Value, include_self: bool, filter: Option<&SocketFilter>) -> usize {
        self.registry
            .broadcast(event, data, Some(self.socket.id()), include_self, filter)
    }
}

/// Sends the single terminal response for one inbound message.
#[derive(Debug)]
struct Responder {
    socket: Arc<Socket>,
    event: String,
    key: String,
    sent: AtomicBool,
}

impl Responder {
    fn respond(&self, result: Result<Value, RpcError>, via: &str) {
        if self.sent.swap(true, Ordering::AcqRel) {
            log::warn!(
                "[Dispatch] Second response for '{}' ({}) via {via} dropped",
                self.event,
                self.key
            );
            return;
        }
        let envelope = ResponseEnvelope::from_result(self.key.clone(), result.map_err(RpcError::normalize));
        if let Err(e) = self.socket.emit_response(&self.event, &envelope) {
            log::warn!(
                "[Dispatch] Failed to send response for '{}' to {}: {e}",
                self.event,
                self.socket.id()
            );
        }
    }

    fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

/// Callback-style responder handed to every handler.
#[derive(Debug)]
pub struct Next {
    responder: Arc<Responder>,
}

impl Next {
    /// Send the terminal response.
    pub fn send(self, result: Result<Value, RpcError>) {
        self.responder.respond(result, "next");
    }

    /// Send a success response.
    pub fn ok(self, data: Value) {
        self.send(Ok(data));
    }

    /// Send an error response.
    pub fn err(self, error: RpcError) {
        self.send(Err(error));
    }

    /// Whether a response has already gone out for this message.
    pub fn is_sent(&self) -> bool {
        self.responder.is_sent()
    }
}

/// Run the handler for one decoded message on its own task.
pub(crate) fn dispatch(
    registry: &Arc<SocketRegistry>,
    socket: Arc<Socket>,
    event: String,
    key: String,
    payload: Value,
) {
    let responder = Arc::new(Responder {
        socket: Arc::clone(&socket),
        event: event.clone(),
        key: key.clone(),
        sent: AtomicBool::new(false),
    });

    let Some(handler) = registry.router().get(&event).cloned() else {
        log::warn!("[Dispatch] No handler for '{event}' from {}", socket.id());
        responder.respond(Err(RpcError::unknown_event(&event)), "router");
        return;
    };

    log::debug!("[Dispatch] '{event}' ({key}) from {}", socket.id());
    let ctx = HandlerContext::new(socket, Arc::clone(registry), event, key);
    tokio::spawn(run_handler(handler, ctx, payload, responder));
}

async fn run_handler(handler: Handler, ctx: HandlerContext, payload: Value, responder: Arc<Responder>) {
    let next = Next {
        responder: Arc::clone(&responder),
    };

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(ctx, payload, next))) {
        Ok(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RpcError::from_panic(panic.as_ref()))),
        Err(panic) => Err(RpcError::from_panic(panic.as_ref())),
    };

    match outcome {
        Ok(Some(value)) => responder.respond(Ok(value), "return"),
        Err(error) => responder.respond(Err(error), "error"),
        Ok(None) => {
            // Nobody else holds a Next: the handler can no longer answer.
            if !responder.is_sent() && Arc::strong_count(&responder) == 1 {
                log::warn!(
                    "[Dispatch] Handler for '{}' finished without responding",
                    responder.event
                );
            }
        }
    }
}
