//! Wire envelope types for worker-parent control messages.
//!
//! Every frame on the control channel is one JSON-encoded [`Envelope`]:
//! `{id, type, command, data, error}`. Requests correlate to responses by id;
//! notifications carry no id and expect no reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id for a request/response pair.
///
/// Locally-issued ids are monotonic integers, never reused while a request is
/// outstanding. Peers are free to use strings for their own requests; the
/// response echoes whatever the request carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeId {
    Number(u64),
    Text(String),
}

impl From<u64> for EnvelopeId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Notification,
}

/// Error payload carried in a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// One framed control-channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<EnvelopeId>,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub command: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl Envelope {
    pub fn request(id: EnvelopeId, command: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id),
            kind: EnvelopeKind::Request,
            command: command.into(),
            data,
            error: None,
        }
    }

    /// Builds the response to a request, carrying either the handler's result
    /// or the failure that should reach the remote caller.
    pub fn response(
        id: EnvelopeId,
        command: impl Into<String>,
        result: Result<Value, WireError>,
    ) -> Self {
        let (data, error) = match result {
            Ok(data) => (data, None),
            Err(e) => (Value::Null, Some(e)),
        };

        Self {
            id: Some(id),
            kind: EnvelopeKind::Response,
            command: command.into(),
            data,
            error,
        }
    }

    pub fn notification(command: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            kind: EnvelopeKind::Notification,
            command: command.into(),
            data,
            error: None,
        }
    }
}
