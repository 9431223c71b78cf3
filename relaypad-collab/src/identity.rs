//! Participant identity and event signing.
//!
//! Two modes exist:
//!
//! - **Personal**: the participant brings their own key (local key material
//!   or an external signer) and the public key is their identity.
//! - **Group**: every member derives the same secret from a shared
//!   passphrase, so all members publish under one public key and are told
//!   apart by the display name in their presence state.

use std::fmt;

use async_trait::async_trait;
use k256::schnorr::SigningKey;
use sha2::{Digest, Sha256};

use crate::event::{SignedEvent, UnsignedEvent};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid secret key")]
    InvalidSecretKey,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Event id does not match its content")]
    IdMismatch,
    #[error("Hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),
}

/// How the local participant is identified to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticipantMode {
    #[default]
    Personal,
    Group,
}

/// Produces signatures over events. Implemented by local key material and
/// by adapters around external signing services.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn public_key(&self) -> Result<String, IdentityError>;

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<SignedEvent, IdentityError>;
}

/// Normalizes a group passphrase: surrounding whitespace trimmed, upper-cased.
pub fn normalize_passphrase(passphrase: &str) -> String {
    passphrase.trim().to_uppercase()
}

/// Derives the shared group secret: SHA-256 of the normalized passphrase.
///
/// `"  hello  "` and `"HELLO"` produce identical keys.
pub fn derive_group_key(passphrase: &str) -> [u8; 32] {
    Sha256::digest(normalize_passphrase(passphrase).as_bytes()).into()
}

/// Local secp256k1 key material.
#[derive(Clone)]
pub struct Keys {
    secret: SigningKey,
    public_key: String,
}

impl Keys {
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret = SigningKey::from_bytes(bytes).map_err(|_| IdentityError::InvalidSecretKey)?;
        let public_key = hex::encode(secret.verifying_key().to_bytes());
        Ok(Self { secret, public_key })
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, IdentityError> {
        Self::from_secret_bytes(&hex::decode(secret.trim())?)
    }

    /// Keys shared by every member who knows `passphrase`.
    pub fn from_group_passphrase(passphrase: &str) -> Result<Self, IdentityError> {
        Self::from_secret_bytes(&derive_group_key(passphrase))
    }

    /// Fresh random keys.
    pub fn generate() -> Self {
        loop {
            let candidate: [u8; 32] = rand::random();
            // Zero or out-of-range scalars are rejected; retry.
            if let Ok(keys) = Self::from_secret_bytes(&candidate) {
                return keys;
            }
        }
    }

    /// Hex-encoded x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Computes the id and signs it. Uses zeroed auxiliary randomness so
    /// the same event always yields the same signature.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<SignedEvent, IdentityError> {
        let id = unsigned.id_for(&self.public_key);
        let signature = self
            .secret
            .sign_raw(&id, &[0u8; 32])
            .map_err(|e| IdentityError::Signing(e.to_string()))?;

        Ok(SignedEvent {
            id: hex::encode(id),
            pubkey: self.public_key.clone(),
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(signature.to_bytes()),
        })
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Keys {
    async fn public_key(&self) -> Result<String, IdentityError> {
        Ok(self.public_key.clone())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<SignedEvent, IdentityError> {
        self.sign(unsigned)
    }
}
