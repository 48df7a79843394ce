//! Envelope definitions for client-server communication.
//!
//! Every inbound text frame is a [`ClientEnvelope`] and every response the
//! server produces is a [`ServerEnvelope`]. Pub/sub relays bypass these
//! types entirely: their payloads are forwarded as published.

use super::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request sent from a client to the server.
///
/// # Example
///
/// ```json
/// {
///   "id": "req-7",
///   "type": "request",
///   "action": "move_piece",
///   "keys": ["game:42"],
///   "args": ["e2", "e4"]
/// }
/// ```
///
/// `keys` is optional for built-in control actions and required for
/// script actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientEnvelope {
    /// Client-chosen correlation token, echoed in the response
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    /// Free-form request type, carried through but not used for dispatch
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,

    /// The action to perform
    pub action: String,

    /// Store keys the script will touch
    #[serde(default)]
    pub keys: Option<Vec<String>>,

    /// Positional arguments
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
}

/// Reads an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ClientEnvelope {
    /// Decodes a frame payload. Any decode failure is an
    /// [`ActionError::InvalidRequest`].
    pub fn decode(frame: &[u8]) -> Result<Self, ActionError> {
        serde_json::from_slice(frame).map_err(|e| ActionError::InvalidRequest(e.to_string()))
    }

    /// Returns `args[index]` if it is a non-empty string.
    pub fn string_arg(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Outcome marker of a [`ServerEnvelope`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// A response sent from the server to a client.
///
/// `result` is present only when `status` is `ok`, `error` only when it is
/// `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEnvelope {
    /// Correlation token of the request, empty for unsolicited events
    #[serde(default)]
    pub id: String,

    /// Always `"response"`
    #[serde(rename = "type")]
    pub kind: String,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerEnvelope {
    /// Successful response carrying `result`.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            kind: "response".to_string(),
            status: Status::Ok,
            result: Some(result),
            error: None,
        }
    }

    /// Error response rendered from an [`ActionError`].
    pub fn error(id: impl Into<String>, error: &ActionError) -> Self {
        Self {
            id: id.into(),
            kind: "response".to_string(),
            status: Status::Error,
            result: None,
            error: Some(error.wire_message()),
        }
    }

    /// Serializes the envelope into a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, ActionError> {
        serde_json::to_vec(self).map_err(|_| ActionError::Internal)
    }
}

/// Per-request failures.
///
/// All of these are recovered at the router boundary; none of them
/// terminates a connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    /// The frame could not be decoded. Logged and dropped, never answered.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or malformed positional arguments.
    #[error("invalid args: {0}")]
    InvalidArgs(String),

    /// Missing keys, or a key that is empty.
    #[error("invalid keys: {0}")]
    InvalidKeys(String),

    /// No script is registered under the action name.
    #[error("script {0} is not loaded")]
    NotLoaded(String),

    /// The store failed while executing the script.
    #[error("script invocation failed: {0}")]
    Invocation(String),

    /// Id generation or plumbing failure. Details are logged, not sent.
    #[error("internal error")]
    Internal,
}

impl ActionError {
    /// Stable error code used as the prefix of the wire message.
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::InvalidRequest(_) => "invalid_request",
            ActionError::InvalidArgs(_) => "invalid_args",
            ActionError::InvalidKeys(_) => "invalid_keys",
            ActionError::NotLoaded(_) | ActionError::Invocation(_) => "script_error",
            ActionError::Internal => "internal_error",
        }
    }

    /// The `error` field of an error envelope: `"<code>: <message>"`.
    pub fn wire_message(&self) -> String {
        match self {
            ActionError::InvalidRequest(msg)
            | ActionError::InvalidArgs(msg)
            | ActionError::InvalidKeys(msg)
            | ActionError::Invocation(msg) => format!("{}: {}", self.code(), msg),
            ActionError::NotLoaded(name) => {
                format!("{}: script {} is not loaded", self.code(), name)
            }
            ActionError::Internal => format!("{}: internal server error", self.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_control_envelope_without_keys() {
        let env = ClientEnvelope::decode(br#"{"id":"a","type":"request","action":"ping"}"#)
            .unwrap();
        assert_eq!(env.id, "a");
        assert_eq!(env.action, "ping");
        assert!(env.keys.is_none());
        assert!(env.args.is_empty());
    }

    #[test]
    fn test_decode_treats_null_fields_as_absent() {
        let env = ClientEnvelope::decode(
            br#"{"id":null,"type":null,"action":"ping","keys":null,"args":null}"#,
        )
        .unwrap();
        assert_eq!(env.id, "");
        assert_eq!(env.kind, "");
        assert!(env.keys.is_none());
        assert!(env.args.is_empty());

        let env = ClientEnvelope::decode(br#"{"id":"x","action":"ping","args":null}"#).unwrap();
        assert_eq!(env.id, "x");
    }

    #[test]
    fn test_decode_rejects_missing_action() {
        let err = ClientEnvelope::decode(br#"{"id":"a"}"#).unwrap_err();
        assert!(matches!(err, ActionError::InvalidRequest(_)));
        assert!(ClientEnvelope::decode(b"not json").is_err());
    }

    #[test]
    fn test_string_arg_skips_empty_and_non_strings() {
        let env = ClientEnvelope::decode(
            br#"{"action":"join_lobby","args":["", 5, "L1"]}"#,
        )
        .unwrap();
        assert_eq!(env.string_arg(0), None);
        assert_eq!(env.string_arg(1), None);
        assert_eq!(env.string_arg(2), Some("L1"));
        assert_eq!(env.string_arg(3), None);
    }

    #[test]
    fn test_ok_envelope_omits_error() {
        let env = ServerEnvelope::ok("x", Value::map([("message", Value::from("pong"))]));
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["type"], "response");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["result"]["message"], "pong");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_envelope_omits_result() {
        let env = ServerEnvelope::error("y", &ActionError::NotLoaded("boom".into()));
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "script_error: script boom is not loaded");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_internal_error_hides_details() {
        assert_eq!(
            ActionError::Internal.wire_message(),
            "internal_error: internal server error"
        );
    }
}
