//! Wire data model shared by client and server.
//!
//! - [`ChunkEnvelope`]: one framed slice of a larger serialized message.
//! - [`ResponseEnvelope`]: terminal `{ data?, error?, _key }` for a request,
//!   also the body of every broadcast.
//! - [`Progress`]: `{ total, done }` on the `<key>~progress` channel.
//! - [`Handshake`]: first message in each direction after connect.
//! - [`RpcEvent`]: per-event request/response schema used by typed calls
//!   and typed handlers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Generate a fresh correlation key.
///
/// UUIDv4 in simple form: unique for the lifetime of any connection.
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One chunk of an encoded message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Correlation key of the message this chunk belongs to.
    pub key: String,
    /// Total chunk count for this key.
    pub size: u32,
    /// 0-based position of this chunk.
    pub index: u32,
    /// Total decoded payload size in bytes.
    #[serde(rename = "byteLength")]
    pub byte_length: u32,
    /// This chunk's slice of the payload.
    pub data: Vec<u8>,
}

/// Terminal message for a request, tagged with the originating key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Structured failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Correlation key of the originating request.
    #[serde(rename = "_key")]
    pub key: String,
}

impl ResponseEnvelope {
    /// Success envelope.
    pub fn success(key: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
            key: key.into(),
        }
    }

    /// Failure envelope.
    pub fn failure(key: impl Into<String>, error: RpcError) -> Self {
        Self {
            data: None,
            error: Some(error),
            key: key.into(),
        }
    }

    /// Envelope for a handler outcome.
    pub fn from_result(key: impl Into<String>, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(data) => Self::success(key, data),
            Err(error) => Self::failure(key, error),
        }
    }

    /// Collapse into the caller-facing result. A missing `data` is `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Upload progress for one key, sent by the receiver per stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Total chunk count.
    pub total: u32,
    /// Chunks received so far.
    pub done: u32,
}

/// Handshake payload.
///
/// The server sends every field; the client echoes back only the session
/// id it wants bound to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session to bind to this connection.
    pub session_id: String,
    /// Server-assigned socket id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    /// Server-advertised cap on encoded message size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
}

/// Body of an `EVENT` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event or channel name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Request/response schema for one event name.
///
/// ```ignore
/// struct Echo;
/// impl RpcEvent for Echo {
///     const NAME: &'static str = "echo";
///     type Request = String;
///     type Response = String;
/// }
/// let reply: String = client.call::<Echo>(&"hi".into()).await?;
/// ```
pub trait RpcEvent {
    /// Event name on the wire.
    const NAME: &'static str;
    /// Request payload schema.
    type Request: Serialize + DeserializeOwned + Send + 'static;
    /// Response payload schema.
    type Response: Serialize + DeserializeOwned + Send + 'static;
}
