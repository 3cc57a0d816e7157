//! # dash-proto
//!
//! Wire protocol definitions for the dashboard gateway control channel.
//!
//! Every frame is a single newline-free JSON text message carrying a `type`
//! discriminator. See [`Frame`] for the full set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod snapshot;

pub use error::ProtoError;
pub use events::{
    is_snapshot_namespace, HealthPayload, KnownEvent, PresencePayload, ShutdownPayload,
    TickPayload,
};
pub use frame::{ErrorShape, EventFrame, Frame, RequestFrame, RequestId, ResponseFrame};
pub use handshake::{
    AuthParams, ChallengeFrame, ClientInfo, DeviceProof, HelloFrame, HelloOkFrame, Policy,
    ServerInfo, SessionInfo, SignatureInput, PROTOCOL_VERSION,
};
pub use snapshot::{PresenceEntry, SessionDefaults, Snapshot};
