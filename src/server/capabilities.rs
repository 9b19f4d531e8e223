//! Composable handler wrappers.
//!
//! Each wrapper is a plain function from [`Handler`] to [`Handler`], composed
//! when the registration table is built:
//!
//! ```ignore
//! let send = broadcast(BroadcastOptions::new().filter(same_room))(require_auth(send_message));
//! router.register("chat.send", send);
//! ```

use std::sync::Arc;

use super::dispatch::Handler;
use super::registry::SocketFilter;
use crate::error::RpcError;

/// Reject the call with a 401 error unless the session has a user.
///
/// The wrapped handler never runs for anonymous sessions.
pub fn require_auth(handler: Handler) -> Handler {
    handler.wrap(|inner, ctx, payload, next| async move {
        if ctx.user().is_none() {
            log::debug!("[Dispatch] '{}' rejected: no authenticated user", ctx.event());
            return Err(RpcError::unauthorized());
        }
        inner.call(ctx, payload, next).await
    })
}

/// Exclude a handler from automatic registration.
pub fn not_socket_method(handler: Handler) -> Handler {
    handler.hidden()
}

/// Options for [`broadcast`].
#[derive(Clone, Default)]
pub struct BroadcastOptions {
    filter: Option<SocketFilter>,
    event: Option<String>,
    include_self: bool,
}

impl std::fmt::Debug for BroadcastOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("filter", &self.filter.is_some())
            .field("event", &self.event)
            .field("include_self", &self.include_self)
            .finish()
    }
}

impl BroadcastOptions {
    /// Broadcast on the handler's own event to everyone but the sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only sockets for which `filter` returns `true` receive the broadcast.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&super::connection::Socket) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Broadcast on `event` instead of the handler's event name.
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Also deliver to the sending socket.
    pub fn include_self(mut self, include_self: bool) -> Self {
        self.include_self = include_self;
        self
    }
}

/// Re-broadcast a handler's resolved value to other connections.
///
/// The caller still receives the value as its normal response. A handler
/// that answers through `next` instead of resolving a value cannot be
/// broadcast; that is logged as a configuration warning.
pub fn broadcast(options: BroadcastOptions) -> impl Fn(Handler) -> Handler {
    move |handler: Handler| {
        let options = options.clone();
        handler.wrap(move |inner, ctx, payload, next| {
            let options = options.clone();
            async move {
                let result = inner.call(ctx.clone(), payload, next).await;
                match &result {
                    Ok(Some(value)) => {
                        let event = options.event.as_deref().unwrap_or(ctx.event());
                        ctx.broadcast(event, value.clone(), options.include_self, options.filter.as_ref());
                    }
                    Ok(None) => log::warn!(
                        "[Dispatch] Broadcast wrapper on '{}' needs a handler that resolves a value; nothing broadcast",
                        ctx.event()
                    ),
                    Err(_) => {}
                }
                result
            }
        })
    }
}
