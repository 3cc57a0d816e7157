//! Gateway client configuration.
//!
//! Configuration covers:
//! - the gateway URL
//! - reconnect policy
//! - request and handshake timeouts
//! - the identity announced in the handshake

use std::path::Path;
use std::time::Duration;

use dash_proto::ClientInfo;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::GatewayError;
use crate::reconnect::ReconnectConfig;

/// Default per-call timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Identity announced in the hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Identity {
    /// Overrides the signer's device id when set.
    pub device_id: Option<String>,
    /// Stable client id.
    pub client_id: String,
    /// Client mode.
    pub client_mode: String,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Client software version.
    pub client_version: String,
    /// Platform string.
    pub platform: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            device_id: None,
            client_id: "dash-gateway".to_string(),
            client_mode: "ui".to_string(),
            role: "operator".to_string(),
            scopes: Vec::new(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl Identity {
    /// Client block for a hello. Each call gets a fresh instance id.
    #[must_use]
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            id: self.client_id.clone(),
            mode: self.client_mode.clone(),
            version: self.client_version.clone(),
            platform: self.platform.clone(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Main client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Default per-call timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Handshake deadline.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Handshake identity.
    #[serde(default)]
    pub identity: Identity,
    /// Session token from a prior connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

const fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

impl GatewayConfig {
    /// Config with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            identity: Identity::default(),
            token: None,
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| GatewayError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let url = Url::parse(&self.url)
            .map_err(|e| GatewayError::Config(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(GatewayError::Config(format!(
                "url scheme must be ws or wss, got '{}'",
                url.scheme()
            )));
        }

        if self.identity.client_id.is_empty() {
            return Err(GatewayError::Config("identity.clientId cannot be empty".to_string()));
        }
        if self.identity.client_mode.is_empty() {
            return Err(GatewayError::Config("identity.clientMode cannot be empty".to_string()));
        }
        if self.identity.role.is_empty() {
            return Err(GatewayError::Config("identity.role cannot be empty".to_string()));
        }
        if self.identity.scopes.iter().any(|s| s.is_empty() || s.contains(',')) {
            return Err(GatewayError::Config(
                "identity.scopes entries must be non-empty and contain no commas".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(GatewayError::Config("requestTimeoutMs must be > 0".to_string()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(GatewayError::Config("handshakeTimeoutMs must be > 0".to_string()));
        }

        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(GatewayError::Config("reconnect.baseDelayMs must be > 0".to_string()));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(GatewayError::Config(
                "reconnect.maxDelayMs must be >= baseDelayMs".to_string(),
            ));
        }
        if !(reconnect.multiplier >= 1.0 && reconnect.multiplier.is_finite()) {
            return Err(GatewayError::Config("reconnect.multiplier must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(GatewayError::Config(
                "reconnect.jitter must be within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }

    /// Default per-call timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Handshake deadline.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
