//! Shared wire layer for both halves of the protocol.
//!
//! # Architecture
//!
//! ```text
//! Client Process                         Server Process
//! ┌──────────────────┐                  ┌──────────────────────┐
//! │ Client           │                  │ SocketServer         │
//! │  RequestRegistry │                  │  UnixListener        │
//! │  Connection      │◄────────────────►│  SocketRegistry      │
//! │  (driver task)   │  frames over     │   Socket per conn    │
//! │                  │  Unix socket     │   Dispatcher         │
//! └──────────────────┘                  └──────────────────────┘
//! ```
//!
//! Payloads are encoded by [`codec`], cut into chunk envelopes, and carried
//! in length-prefixed frames defined by [`framing`].

pub mod codec;
pub mod framing;
