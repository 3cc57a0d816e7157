//! Server-authoritative aggregate state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One connected client as seen by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Host name of the client machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Remote address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Client version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Client platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Client mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Why this entry was last updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Last-seen timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    /// Fields this client does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Session defaults the server applies to new conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefaults {
    /// Default agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent_id: Option<String>,
    /// Main session key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_session_key: Option<String>,
    /// Session scoping mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Fields this client does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Full-state replacement payload.
///
/// A snapshot is always replaced as a whole; nothing in this layer patches
/// individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Connected clients keyed by client id.
    #[serde(default)]
    pub presence: HashMap<String, PresenceEntry>,
    /// Session defaults.
    #[serde(default)]
    pub session_defaults: SessionDefaults,
    /// Health indicators keyed by subsystem.
    #[serde(default)]
    pub health: Map<String, Value>,
    /// Server state version this snapshot was taken at.
    #[serde(default)]
    pub state_version: u64,
}

impl Snapshot {
    /// Number of presence entries.
    #[must_use]
    pub fn presence_count(&self) -> usize {
        self.presence.len()
    }

    /// Copy of this snapshot with the presence map swapped out.
    #[must_use]
    pub fn with_presence(&self, presence: HashMap<String, PresenceEntry>, state_version: u64) -> Self {
        Self {
            presence,
            session_defaults: self.session_defaults.clone(),
            health: self.health.clone(),
            state_version,
        }
    }

    /// Copy of this snapshot with the health map swapped out.
    #[must_use]
    pub fn with_health(&self, health: Map<String, Value>, state_version: u64) -> Self {
        Self {
            presence: self.presence.clone(),
            session_defaults: self.session_defaults.clone(),
            health,
            state_version,
        }
    }
}
