//! Transport-neutral frames.
//!
//! The actor reads and writes [`Frame`]s so it can be driven by the axum
//! WebSocket in production and by plain channels in tests.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Frame {
    /// Wraps an outbound payload: text when it is UTF-8, binary otherwise.
    pub fn from_payload(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(text) => Frame::Text(text.to_string()),
            Err(_) => Frame::Binary(payload),
        }
    }

    /// Bytes to decode as a request. `None` for control frames.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(text) => Some(text.as_bytes()),
            Frame::Binary(bytes) => Some(bytes.as_ref()),
            Frame::Close => None,
        }
    }
}
