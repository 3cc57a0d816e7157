//! Error types for dash-gateway.

use dash_proto::{ErrorShape, ProtoError};
use serde_json::Value;
use thiserror::Error;

use crate::state::ConnectionState;

/// Errors surfaced by the gateway client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// A call was attempted outside the `Ready` state.
    #[error("gateway not ready (state: {state})")]
    NotReady {
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// No response arrived before the deadline.
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The connection went away while the call was pending.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why the connection closed.
        reason: String,
    },

    /// The server rejected the handshake.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A frame could not be encoded, decoded or was out of place.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered `ok: false`.
    #[error("gateway error {code}: {message}")]
    Gateway {
        /// Server error code.
        code: String,
        /// Server error message.
        message: String,
        /// Server error detail.
        details: Option<Value>,
    },

    /// The socket could not be opened or failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotReady { .. } => "NOT_READY",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConnectionClosed { .. } => "CONNECTION_CLOSED",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the caller may reasonably retry the same call later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady { .. }
                | Self::Timeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Transport(_)
        )
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

impl From<ErrorShape> for GatewayError {
    fn from(shape: ErrorShape) -> Self {
        Self::Gateway {
            code: shape.code,
            message: shape.message,
            details: shape.details,
        }
    }
}

impl From<ProtoError> for GatewayError {
    fn from(err: ProtoError) -> Self {
        Self::Protocol(err.to_string())
    }
}
