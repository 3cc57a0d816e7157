//! Error types for the dash-proto crate.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A payload did not have the shape its event name promises.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event name the payload arrived under.
        event: String,
        /// What was wrong with it.
        reason: String,
    },
}
