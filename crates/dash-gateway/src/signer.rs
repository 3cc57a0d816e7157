//! Device identity and handshake signing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// Signs the canonical handshake message on behalf of a device.
pub trait DeviceSigner: Send + Sync {
    /// Stable device id.
    fn device_id(&self) -> String;

    /// Base64 public key the server verifies against.
    fn public_key(&self) -> String;

    /// Base64 signature over `message`.
    fn sign(&self, message: &str) -> String;
}

/// Ed25519 device key.
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl Ed25519Signer {
    /// Generate a fresh key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from raw secret key bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load from a base64 secret key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the text is not base64 or not 32
    /// bytes long.
    pub fn from_secret_base64(encoded: &str) -> Result<Self, GatewayError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| GatewayError::Config(format!("device key is not base64: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            GatewayError::Config(format!("device key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Base64 secret key, for persisting the identity.
    #[must_use]
    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }
}

impl DeviceSigner for Ed25519Signer {
    fn device_id(&self) -> String {
        let digest = Sha256::digest(self.signing_key.verifying_key().as_bytes());
        hex::encode(digest)
    }

    fn public_key(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().as_bytes())
    }

    fn sign(&self, message: &str) -> String {
        STANDARD.encode(self.signing_key.sign(message.as_bytes()).to_bytes())
    }
}

/// Check a base64 signature against a base64 public key.
#[must_use]
pub fn verify_signature(public_key: &str, message: &str, signature: &str) -> bool {
    let Ok(key_bytes) = STANDARD.decode(public_key) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message.as_bytes(), &sig).is_ok()
}
