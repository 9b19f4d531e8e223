//! socket-rpc - multiplexed request/response messaging over Unix sockets.
//!
//! Clients send named requests whose payloads are split into chunks and
//! reassembled on the far side; the server dispatches each complete message
//! to a handler and sends back exactly one response carrying the original
//! correlation key. Servers can also broadcast to many connections.
//!
//! # Architecture
//!
//! - **Client** - connection state machine, outbound queue, pending requests with timeouts
//! - **Server** - socket registry, dispatcher, capability wrappers, sessions
//! - **Socket** - chunk codec and wire framing shared by both halves
//!
//! # Modules
//!
//! - [`client`] - [`Client`] handle and its transport driver
//! - [`server`] - [`SocketServer`], [`SocketRegistry`], handlers and wrappers
//! - [`socket`] - payload codec, reassembly, and frame format
//! - [`protocol`] - wire data model
//! - [`config`] - configuration loading

// Library modules
pub mod client;
pub mod demo;
pub mod server;
pub mod socket;

pub mod config;
pub mod constants;
pub mod error;
pub mod listeners;
pub mod protocol;

// Re-export commonly used types
pub use client::{Client, ClientEvent, ConnectionState, RequestOptions};
pub use config::Config;
pub use error::{ProtocolError, RpcError};
pub use protocol::{Progress, ResponseEnvelope, RpcEvent};
pub use server::{
    Handler, HandlerContext, HandlerGroup, Next, Router, Session, SessionStore, SocketRegistry,
    SocketServer, User,
};
