//! Handshake frames and the canonical device-signature message.
//!
//! The handshake runs once per connection:
//!
//! 1. client sends [`HelloFrame`] announcing client id, mode, role and scopes
//! 2. server replies [`ChallengeFrame`] with an optional nonce
//! 3. client signs [`SignatureInput::canonical_message`] and resends the hello
//!    with a [`DeviceProof`]
//! 4. server replies [`HelloOkFrame`], or a failed response for the hello id

use serde::{Deserialize, Serialize};

use crate::frame::RequestId;
use crate::snapshot::Snapshot;

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client identification sent in every hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Stable client id.
    pub id: String,
    /// Client mode, e.g. `ui` or `browser`.
    pub mode: String,
    /// Client software version.
    pub version: String,
    /// OS / platform string.
    pub platform: String,
    /// Per-process instance id.
    pub instance_id: String,
}

/// Signed proof of device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    /// Device id.
    pub id: String,
    /// Base64 public key.
    pub public_key: String,
    /// Base64 signature over the canonical message.
    pub signature: String,
    /// Signing timestamp in milliseconds.
    pub signed_at: u64,
    /// Nonce that was signed, if the server issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Shared-secret authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    /// Prior session token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Client handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    /// Id used by the server when rejecting this hello.
    pub id: RequestId,
    /// Lowest protocol version accepted.
    pub min_protocol: u32,
    /// Highest protocol version accepted.
    pub max_protocol: u32,
    /// Client identification.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Device proof, present on the signed hello.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
    /// Token auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

impl HelloFrame {
    /// Create an unsigned hello.
    #[must_use]
    pub fn new(client: ClientInfo, role: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            id: RequestId::new(),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: role.into(),
            scopes,
            device: None,
            auth: None,
        }
    }

    /// Attach a device proof.
    #[must_use]
    pub fn with_device(mut self, proof: DeviceProof) -> Self {
        self.device = Some(proof);
        self
    }

    /// Attach a session token.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth = token.map(|token| AuthParams { token: Some(token) });
        self
    }
}

/// Server handshake challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChallengeFrame {
    /// Nonce the client must include in its signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Server timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Server identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server version.
    pub version: String,
    /// Server-side connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
}

/// Session identity granted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: String,
    /// Token to present on the next handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Connection policy advertised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Interval at which the server emits `tick` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    /// Maximum accepted frame size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<usize>,
}

/// Server handshake acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOkFrame {
    /// Negotiated protocol version.
    pub protocol: u32,
    /// Server identification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    /// Session identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    /// Server state version at acceptance.
    #[serde(default)]
    pub state_version: u64,
    /// Initial snapshot, if the server embeds one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Connection policy.
    #[serde(default)]
    pub policy: Policy,
}

/// Inputs to the device signature.
///
/// Field order in [`canonical_message`](Self::canonical_message) is part of
/// the protocol; the server rebuilds the same string to verify.
#[derive(Debug, Clone, Copy)]
pub struct SignatureInput<'a> {
    /// Device id.
    pub device_id: &'a str,
    /// Client id.
    pub client_id: &'a str,
    /// Client mode.
    pub client_mode: &'a str,
    /// Requested role.
    pub role: &'a str,
    /// Requested scopes.
    pub scopes: &'a [String],
    /// Signing time in milliseconds since the epoch.
    pub signed_at_ms: u64,
    /// Prior session token.
    pub token: Option<&'a str>,
    /// Server nonce.
    pub nonce: Option<&'a str>,
}

impl SignatureInput<'_> {
    /// Build the `|`-joined message that gets signed.
    ///
    /// `v1` carries seven fields; `v2` appends the nonce as an eighth. An
    /// empty nonce counts as absent.
    #[must_use]
    pub fn canonical_message(&self) -> String {
        let nonce = self.nonce.filter(|n| !n.is_empty());
        let version = if nonce.is_some() { "v2" } else { "v1" };
        let signed_at = self.signed_at_ms.to_string();
        let scopes = self.scopes.join(",");

        let mut parts = vec![
            version,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or(""),
        ];
        if let Some(nonce) = nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}
