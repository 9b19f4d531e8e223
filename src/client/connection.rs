//! Client connection state machine and outbound queue.
//!
//! ```text
//! None ──connect()──► Connecting ──transport up──► Connected
//!                                                   │    ▲
//!                                      transport down    transport up
//!                                                   ▼    │
//!                                                 Disconnected
//! ```
//!
//! Emissions made while not `Connected` wait in a FIFO queue that is drained
//! in order on the next transition to `Connected`.

use std::collections::VecDeque;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ProtocolError;

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// `connect()` has not been called.
    #[default]
    None,
    /// Waiting for the first transport connect.
    Connecting,
    /// Transport is up; emissions go straight out.
    Connected,
    /// Transport dropped; emissions queue until it comes back.
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Outbound half of the client: current state, live transport, and queue.
#[derive(Debug, Default)]
pub(crate) struct Connection {
    state: ConnectionState,
    transport: Option<UnboundedSender<Vec<u8>>>,
    queue: VecDeque<Vec<u8>>,
}

impl Connection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Frames waiting for the transport.
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// `None → Connecting`.
    pub(crate) fn begin_connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        if self.state != ConnectionState::None {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.state = ConnectionState::Connecting;
        Ok(self.state)
    }

    /// Transport came up: send `preamble` first, then drain the queue.
    ///
    /// Returns the new state when this was a transition.
    pub(crate) fn transport_connected(
        &mut self,
        transport: UnboundedSender<Vec<u8>>,
        preamble: Option<Vec<u8>>,
    ) -> Option<ConnectionState> {
        let changed = self.state != ConnectionState::Connected;
        self.state = ConnectionState::Connected;
        self.transport = Some(transport);

        if let Some(frame) = preamble {
            self.send_now(frame);
        }
        let queued = self.queue.len();
        while let Some(frame) = self.queue.pop_front() {
            if let Err(frame) = self.try_send(frame) {
                // Transport died mid-drain: keep the frame at the head.
                self.queue.push_front(frame);
                break;
            }
        }
        if queued > 0 {
            log::debug!("[Client] Flushed {} queued frame(s)", queued - self.queue.len());
        }

        changed.then_some(self.state)
    }

    /// Transport went down.
    ///
    /// Only `Connected` moves to `Disconnected`; a failed first attempt
    /// stays `Connecting`.
    pub(crate) fn transport_disconnected(&mut self) -> Option<ConnectionState> {
        self.transport = None;
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            return Some(self.state);
        }
        None
    }

    /// Send now when connected with nothing queued ahead, else queue.
    pub(crate) fn emit(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if self.state == ConnectionState::Connected && self.queue.is_empty() {
                if let Err(frame) = self.try_send(frame) {
                    self.queue.push_back(frame);
                }
            } else {
                self.queue.push_back(frame);
            }
        }
    }

    /// Send bypassing the queue. Returns `false` with no live transport.
    pub(crate) fn send_now(&mut self, frame: Vec<u8>) -> bool {
        self.try_send(frame).is_ok()
    }

    fn try_send(&mut self, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        let result = match &self.transport {
            Some(transport) => transport.send(frame).map_err(|SendError(frame)| frame),
            None => return Err(frame),
        };
        if result.is_err() {
            self.transport = None;
        }
        result
    }
}
