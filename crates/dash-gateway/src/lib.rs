//! # dash-gateway
//!
//! Client protocol layer between a dashboard and its gateway.
//!
//! This crate provides:
//! - A WebSocket transport with an in-memory twin for tests
//! - The challenge/response device handshake
//! - Request/response correlation with per-call timeouts
//! - An event bus with exact and prefix-wildcard subscriptions
//! - Exponential-backoff reconnection
//! - A server-authoritative snapshot store
//! - A bounded diagnostic log
//!
//! [`GatewayConnection`] ties these together.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dash_gateway::{Ed25519Signer, GatewayConfig, GatewayConnection};
//!
//! let conn = GatewayConnection::websocket(Arc::new(Ed25519Signer::generate()));
//! conn.connect(GatewayConfig::new("ws://127.0.0.1:18789"))?;
//! conn.wait_ready(std::time::Duration::from_secs(10)).await?;
//! let stats = conn.call("stats.get", None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod diagnostics;
pub mod error;
mod handshake;
pub mod liveness;
pub mod reconnect;
pub mod signer;
pub mod snapshot;
pub mod state;
mod subscription;
pub mod transport;

pub use bus::{is_wildcard, EventBus, Once, Scope};
pub use config::{GatewayConfig, Identity};
pub use connection::{GatewayConnection, SessionDetails, SNAPSHOT_METHOD};
pub use correlator::{Correlator, CorrelatorMetrics, ResponseFuture};
pub use diagnostics::{Category, DiagnosticEvent, DiagnosticLog, Level};
pub use error::GatewayError;
pub use handshake::CLOSE_POLICY_VIOLATION;
pub use liveness::LivenessMonitor;
pub use reconnect::{ReconnectConfig, ReconnectMetrics, ReconnectSignal, Reconnector};
pub use signer::{verify_signature, DeviceSigner, Ed25519Signer};
pub use snapshot::SnapshotStore;
pub use state::{ConnectionState, StateChange};
pub use subscription::Subscription;
pub use transport::{Outbound, Socket, SocketEvent, Transport, WebSocketTransport};
