//! Protocol-wide constants for socket-rpc.
//!
//! Centralizes the defaults, reserved event names, and wire error codes so
//! the client and server halves agree on them without sharing config.
//!
//! # Categories
//!
//! - **Sizes**: chunk and message size defaults
//! - **Timeouts**: request timeout and reconnect interval
//! - **Events**: reserved lifecycle event names
//! - **Error codes**: distinguished `code` values in the wire error shape

use std::time::Duration;

// ============================================================================
// Sizes
// ============================================================================

/// Default maximum bytes of payload data carried by one chunk (10 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;

/// Default cap on the encoded size of a single message (100 MiB).
///
/// The client enforces the lesser of this and the server-advertised cap.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Largest chunk size a config may request.
///
/// Leaves room under the 16 MiB frame cap for the chunk header
/// (event name, key, and three u32 fields).
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// Default time a client waits for a response before failing with
/// [`ERR_TIMEOUT`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Delay between client transport reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1_000);

/// How long an in-memory session outlives its last connection, so a
/// reconnecting client can still resume it.
pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_secs(60);

// ============================================================================
// Events
// ============================================================================

/// Server → client on accept, echoed back by the client.
pub const EVENT_HANDSHAKE: &str = "handshake";

/// Client-local: fires on every connection state transition.
pub const EVENT_STATE: &str = "state";

/// Transport-level errors, on both sides.
pub const EVENT_ERROR: &str = "error";

/// Server-local: a socket joined the registry.
pub const EVENT_CONNECTION: &str = "connection";

/// Server-local: a socket left the registry.
pub const EVENT_DISCONNECT: &str = "disconnect";

/// Suffix of the derived per-key progress channel (`<key>~progress`).
pub const PROGRESS_SUFFIX: &str = "~progress";

// ============================================================================
// Error codes
// ============================================================================

/// Client-side request timeout.
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";

/// Handler requires an authenticated session.
pub const ERR_UNAUTHORIZED: &str = "ERR_UNAUTHORIZED";

/// Encoded payload exceeds the negotiated maximum.
pub const ERR_PAYLOAD_TOO_LARGE: &str = "ERR_PAYLOAD_TOO_LARGE";

/// Payload failed to decode into the event's request/response schema.
pub const ERR_INVALID_PAYLOAD: &str = "ERR_INVALID_PAYLOAD";

/// No handler is registered for the requested event.
pub const ERR_UNKNOWN_EVENT: &str = "ERR_UNKNOWN_EVENT";

/// Chunks could not be put back together.
pub const ERR_REASSEMBLY: &str = "ERR_REASSEMBLY";

/// Default code for handler failures that carry none.
pub const ERR_INTERNAL: &str = "ERR_INTERNAL";

/// Default status code for handler failures that carry none.
pub const DEFAULT_STATUS_CODE: u16 = 500;

/// Derive the progress channel name for a correlation key.
pub fn progress_channel(key: &str) -> String {
    format!("{key}{PROGRESS_SUFFIX}")
}

/// Extract the correlation key from a progress channel name.
pub fn progress_key(event: &str) -> Option<&str> {
    event.strip_suffix(PROGRESS_SUFFIX)
}
