//! Typed vocabulary for the server events this layer understands.
//!
//! Anything outside the vocabulary stays opaque as [`KnownEvent::Other`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;
use crate::frame::EventFrame;
use crate::snapshot::{PresenceEntry, Snapshot};

/// Event name for server ticks.
pub const TICK: &str = "tick";
/// Event name for presence replacement.
pub const PRESENCE: &str = "presence";
/// Event name for health replacement.
pub const HEALTH: &str = "health";
/// Event name announcing a server shutdown.
pub const SHUTDOWN: &str = "shutdown";
/// Event name (and namespace prefix) for full snapshots.
pub const SNAPSHOT: &str = "snapshot";

/// Payload of a `tick` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Server time in milliseconds.
    pub ts: u64,
}

/// Payload of a `presence` event: the complete presence map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Connected clients keyed by client id.
    pub presence: HashMap<String, PresenceEntry>,
}

/// Payload of a `health` event: the complete health map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    /// Health indicators keyed by subsystem.
    pub health: Map<String, Value>,
}

/// Payload of a `shutdown` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownPayload {
    /// Why the server is going away.
    pub reason: String,
    /// When the server expects to be back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_expected_ms: Option<u64>,
}

/// A server event decoded into the known vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownEvent {
    /// Server liveness tick.
    Tick(TickPayload),
    /// Presence replacement.
    Presence(PresencePayload),
    /// Health replacement.
    Health(HealthPayload),
    /// Server is shutting down.
    Shutdown(ShutdownPayload),
    /// Full snapshot pushed as an event.
    Snapshot(Box<Snapshot>),
    /// Any other event, payload untouched.
    Other {
        /// Event name.
        name: String,
        /// Raw payload.
        payload: Value,
    },
}

impl KnownEvent {
    /// Decode an event frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidPayload`] when a known event name carries a
    /// payload of the wrong shape.
    pub fn parse(frame: &EventFrame) -> Result<Self, ProtoError> {
        let name = frame.event.as_str();
        match name {
            TICK => decode(frame).map(Self::Tick),
            PRESENCE => decode(frame).map(Self::Presence),
            HEALTH => decode(frame).map(Self::Health),
            SHUTDOWN => decode(frame).map(Self::Shutdown),
            _ if is_snapshot_namespace(name) => {
                decode(frame).map(|s| Self::Snapshot(Box::new(s)))
            }
            _ => Ok(Self::Other {
                name: name.to_string(),
                payload: frame.payload().clone(),
            }),
        }
    }

    /// Event name this variant was decoded from.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Tick(_) => TICK,
            Self::Presence(_) => PRESENCE,
            Self::Health(_) => HEALTH,
            Self::Shutdown(_) => SHUTDOWN,
            Self::Snapshot(_) => SNAPSHOT,
            Self::Other { name, .. } => name,
        }
    }
}

/// Whether an event name belongs to the snapshot/presence namespace.
#[must_use]
pub fn is_snapshot_namespace(name: &str) -> bool {
    name == PRESENCE
        || name == HEALTH
        || name == SNAPSHOT
        || name
            .strip_prefix(SNAPSHOT)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn decode<T: DeserializeOwned>(frame: &EventFrame) -> Result<T, ProtoError> {
    serde_json::from_value(frame.payload().clone()).map_err(|e| ProtoError::InvalidPayload {
        event: frame.event.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("presence", true ; "presence")]
    #[test_case("health", true ; "health")]
    #[test_case("snapshot", true ; "snapshot")]
    #[test_case("snapshot.replace", true ; "snapshot child")]
    #[test_case("snapshots", false ; "lookalike")]
    #[test_case("pm.task.create", false ; "business event")]
    fn test_snapshot_namespace(name: &str, expected: bool) {
        assert_eq!(is_snapshot_namespace(name), expected);
    }

    #[test]
    fn test_parse_tick() {
        let event = KnownEvent::parse(&EventFrame::new("tick", json!({"ts": 99}))).unwrap();
        assert_eq!(event, KnownEvent::Tick(TickPayload { ts: 99 }));
        assert_eq!(event.name(), "tick");
    }

    #[test]
    fn test_parse_presence() {
        let frame = EventFrame::new("presence", json!({"presence": {"c1": {"host": "a"}}}));
        let KnownEvent::Presence(payload) = KnownEvent::parse(&frame).unwrap() else {
            panic!("expected presence");
        };
        assert_eq!(payload.presence["c1"].host.as_deref(), Some("a"));
    }

    #[test]
    fn test_parse_shutdown() {
        let frame = EventFrame::new("shutdown", json!({"reason": "upgrade", "restartExpectedMs": 5000}));
        assert_eq!(
            KnownEvent::parse(&frame).unwrap(),
            KnownEvent::Shutdown(ShutdownPayload {
                reason: "upgrade".to_string(),
                restart_expected_ms: Some(5000),
            })
        );
    }

    #[test]
    fn test_parse_snapshot_child_event() {
        let frame = EventFrame::new("snapshot.replace", json!({"stateVersion": 4}));
        let KnownEvent::Snapshot(snapshot) = KnownEvent::parse(&frame).unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.state_version, 4);
    }

    #[test]
    fn test_unknown_event_is_opaque() {
        let frame = EventFrame::new("pm.task.create", json!({"id": 1}));
        assert_eq!(
            KnownEvent::parse(&frame).unwrap(),
            KnownEvent::Other {
                name: "pm.task.create".to_string(),
                payload: json!({"id": 1}),
            }
        );
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let frame = EventFrame::new("tick", json!({"ts": "soon"}));
        assert!(matches!(
            KnownEvent::parse(&frame),
            Err(ProtoError::InvalidPayload { .. })
        ));
    }
}
