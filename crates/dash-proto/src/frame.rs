//! Frame definitions.
//!
//! A [`Frame`] is one discrete JSON message on the wire. Request and response
//! frames are correlated by [`RequestId`]; event frames are unsolicited.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtoError;
use crate::handshake::{ChallengeFrame, HelloFrame, HelloOkFrame};
use crate::snapshot::Snapshot;

static NULL: Value = Value::Null;

/// Correlation id linking a request frame to its response frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random `RequestId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discriminated wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Client to server call.
    Request(RequestFrame),
    /// Server reply to a prior request.
    Response(ResponseFrame),
    /// Unsolicited server push.
    Event(EventFrame),
    /// Full-state replacement.
    Snapshot(Snapshot),
    /// Client handshake announcement, optionally carrying a device proof.
    Hello(HelloFrame),
    /// Server handshake challenge.
    Challenge(ChallengeFrame),
    /// Server handshake acceptance.
    HelloOk(HelloOkFrame),
}

impl Frame {
    /// The wire discriminator of this frame.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Snapshot(_) => "snapshot",
            Self::Hello(_) => "hello",
            Self::Challenge(_) => "challenge",
            Self::HelloOk(_) => "hello-ok",
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or has an unknown `type`.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

impl From<RequestFrame> for Frame {
    fn from(frame: RequestFrame) -> Self {
        Self::Request(frame)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(frame: ResponseFrame) -> Self {
        Self::Response(frame)
    }
}

impl From<EventFrame> for Frame {
    fn from(frame: EventFrame) -> Self {
        Self::Event(frame)
    }
}

/// A client to server call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id.
    pub id: RequestId,
    /// Method name, e.g. `stats.get`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    /// Create a request with a fresh id.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: RequestId::new(),
            method: method.into(),
            params,
        }
    }
}

/// Application error returned by the server in a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Extra structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the server considers a retry worthwhile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    /// Create an error with just a code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A server reply correlated to a prior request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Create a successful response.
    #[must_use]
    pub fn success(id: impl Into<RequestId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Create a failed response.
    #[must_use]
    pub fn failure(id: impl Into<RequestId>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Split into the payload or the server error.
    ///
    /// A failed response without an error body yields a generic `UNAVAILABLE`
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns the server's error shape when `ok` is false.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ErrorShape::new("UNAVAILABLE", "request failed")))
        }
    }
}

/// An unsolicited server push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Event name, dot-namespaced, e.g. `pm.task.create`.
    pub event: String,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Monotonic server sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Server state version at emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
}

impl EventFrame {
    /// Create an event frame.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: None,
            state_version: None,
        }
    }

    /// Set the sequence number.
    #[must_use]
    pub const fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Set the state version.
    #[must_use]
    pub const fn with_state_version(mut self, version: u64) -> Self {
        self.state_version = Some(version);
        self
    }

    /// The payload, or `null` if absent.
    #[must_use]
    pub fn payload(&self) -> &Value {
        self.payload.as_ref().unwrap_or(&NULL)
    }
}
