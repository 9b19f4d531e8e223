//! Error types for the protocol core.
//!
//! Two layers:
//!
//! - [`ProtocolError`]: local failures (oversize payloads, broken reassembly,
//!   lifecycle misuse). Never crosses the wire as-is.
//! - [`RpcError`]: the wire error shape `{ message, code, statusCode?, ..payload }`
//!   carried inside a Response Envelope. Every handler failure, whatever its
//!   origin, is normalized into one of these.

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    DEFAULT_STATUS_CODE, ERR_INTERNAL, ERR_INVALID_PAYLOAD, ERR_PAYLOAD_TOO_LARGE,
    ERR_REASSEMBLY, ERR_TIMEOUT, ERR_UNAUTHORIZED, ERR_UNKNOWN_EVENT,
};

/// Local protocol failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Encoded payload exceeds the negotiated maximum message size.
    PayloadTooLarge {
        /// Encoded payload size in bytes.
        size: usize,
        /// Effective maximum in bytes.
        max: usize,
    },
    /// Chunks for a key could not be reassembled.
    Reassembly(String),
    /// `connect()` called on a connection that already left `None`.
    AlreadyConnected,
    /// The connection or its writer has gone away.
    Closed,
    /// A frame could not be encoded or decoded.
    Frame(String),
    /// A payload could not be serialized or deserialized.
    Encoding(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Payload too large: {size} bytes (max {max})")
            }
            Self::Reassembly(msg) => write!(f, "Reassembly failed: {msg}"),
            Self::AlreadyConnected => write!(f, "Connection already started"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Frame(msg) => write!(f, "Frame error: {msg}"),
            Self::Encoding(msg) => write!(f, "Encoding error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Structured error carried in a Response Envelope.
///
/// Serializes as `{ "message", "code", "statusCode"?, ..payload }`; any extra
/// fields are flattened into `payload` on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Human-readable description.
    pub message: String,
    /// Machine-readable code, e.g. `ERR_TIMEOUT`.
    #[serde(default)]
    pub code: String,
    /// HTTP-style status code.
    #[serde(
        rename = "statusCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub status_code: Option<u16>,
    /// Arbitrary extra fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RpcError {
    /// Build an error with an explicit code and status.
    pub fn new(message: impl Into<String>, code: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            status_code: Some(status_code),
            payload: Map::new(),
        }
    }

    /// Generic internal failure (`ERR_INTERNAL`, 500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, ERR_INTERNAL, DEFAULT_STATUS_CODE)
    }

    /// Client-side timeout for `event`.
    ///
    /// Carries no status code: nothing came back from the server.
    pub fn timeout(event: &str) -> Self {
        Self {
            message: format!("The request '{event}' timed out."),
            code: ERR_TIMEOUT.to_string(),
            status_code: None,
            payload: Map::new(),
        }
    }

    /// Session has no authenticated user.
    pub fn unauthorized() -> Self {
        Self::new("Authentication required.", ERR_UNAUTHORIZED, 401)
    }

    /// Payload did not match the event's schema.
    pub fn invalid_payload(event: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            format!("Invalid payload for '{event}': {reason}"),
            ERR_INVALID_PAYLOAD,
            400,
        )
    }

    /// No handler registered under `event`.
    pub fn unknown_event(event: &str) -> Self {
        Self::new(format!("Unknown event '{event}'."), ERR_UNKNOWN_EVENT, 404)
    }

    /// Attach an extra payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Fill the default `code`/`statusCode` when absent.
    pub fn normalize(mut self) -> Self {
        if self.code.is_empty() {
            self.code = ERR_INTERNAL.to_string();
        }
        if self.status_code.is_none() {
            self.status_code = Some(DEFAULT_STATUS_CODE);
        }
        self
    }

    /// Normalize an arbitrary JSON value thrown by a handler.
    ///
    /// Objects with a `message` field are read as the error shape; strings
    /// become the message; anything else is stringified.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(ref map) if map.contains_key("message") => {
                match serde_json::from_value::<RpcError>(value.clone()) {
                    Ok(err) => err.normalize(),
                    Err(_) => Self::internal(value.to_string()),
                }
            }
            Value::String(message) => Self::internal(message),
            other => Self::internal(other.to_string()),
        }
    }

    /// Normalize a caught panic payload.
    pub fn from_panic(panic: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "Handler panicked".to_string()
        };
        Self::internal(message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<RpcError>() {
            Ok(err) => err.normalize(),
            Err(e) => Self::internal(format!("{e:#}")),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::PayloadTooLarge { size, max } => {
                Self::new(e.to_string(), ERR_PAYLOAD_TOO_LARGE, 413)
                    .with_field("size", size)
                    .with_field("max", max)
            }
            ProtocolError::Reassembly(_) => Self::new(e.to_string(), ERR_REASSEMBLY, 400),
            ProtocolError::Encoding(_) => Self::new(e.to_string(), ERR_INVALID_PAYLOAD, 400),
            ProtocolError::AlreadyConnected | ProtocolError::Closed | ProtocolError::Frame(_) => {
                Self::internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_wire_shape() {
        let err = RpcError::new("nope", "ERR_NOPE", 418).with_field("retry", true);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({"message": "nope", "code": "ERR_NOPE", "statusCode": 418, "retry": true})
        );
    }

    #[test]
    fn test_timeout_omits_status_code() {
        let value = serde_json::to_value(RpcError::timeout("users.list")).unwrap();
        assert_eq!(value["message"], "The request 'users.list' timed out.");
        assert_eq!(value["code"], "ERR_TIMEOUT");
        assert!(value.get("statusCode").is_none());
    }

    #[test]
    fn test_from_value_fills_defaults() {
        let err = RpcError::from_value(json!({"message": "bad thing", "field": "name"}));
        assert_eq!(err.message, "bad thing");
        assert_eq!(err.code, ERR_INTERNAL);
        assert_eq!(err.status_code, Some(500));
        assert_eq!(err.payload["field"], "name");
    }

    #[test]
    fn test_from_value_keeps_explicit_code() {
        let err = RpcError::from_value(json!({"message": "gone", "code": "ERR_GONE", "statusCode": 410}));
        assert_eq!(err.code, "ERR_GONE");
        assert_eq!(err.status_code, Some(410));
    }

    #[test]
    fn test_from_value_string_and_scalar() {
        assert_eq!(RpcError::from_value(json!("boom")).message, "boom");
        assert_eq!(RpcError::from_value(json!(42)).message, "42");
    }

    #[test]
    fn test_from_anyhow_preserves_rpc_error() {
        let err: RpcError = anyhow::Error::new(RpcError::unauthorized()).into();
        assert_eq!(err.code, ERR_UNAUTHORIZED);
        assert_eq!(err.status_code, Some(401));

        let err: RpcError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.code, ERR_INTERNAL);
        assert!(err.message.contains("disk on fire"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(RpcError::from_panic(boxed.as_ref()).message, "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(RpcError::from_panic(boxed.as_ref()).message, "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(RpcError::from_panic(boxed.as_ref()).message, "Handler panicked");
    }

    #[test]
    fn test_payload_too_large_maps_to_413() {
        let err: RpcError = ProtocolError::PayloadTooLarge { size: 20, max: 10 }.into();
        assert_eq!(err.code, ERR_PAYLOAD_TOO_LARGE);
        assert_eq!(err.status_code, Some(413));
        assert_eq!(err.payload["size"], 20);
    }
}
