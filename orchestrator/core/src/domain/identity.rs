// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Identity
//!
//! Every shard owns exactly one [`ShardIdentity`]: an immutable [`ShardId`], an
//! Ed25519 keypair, the capabilities it advertises and a small trust level.
//! The identity is never shared; peers only ever see its [`PublicKey`].
//!
//! Signing and verification are pure functions over raw message bytes. A failed
//! verification is a `false`, not an error: callers drop the message and move on.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::capability::Capability;

/// Unique, immutable identifier of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub Uuid);

impl ShardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Base64-encoded Ed25519 verifying key, safe to hand to peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(STANDARD.encode(key.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into a usable verifying key.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes = STANDARD
            .decode(&self.0)
            .map_err(|e| IdentityError::InvalidPublicKey(format!("invalid base64: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidPublicKey("must be 32 bytes".to_string())
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }
}

impl From<String> for PublicKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credential and capability list of one shard.
pub struct ShardIdentity {
    shard_id: ShardId,
    signing_key: SigningKey,
    public_key: PublicKey,
    capabilities: Vec<Capability>,
    trust_level: u8,
}

impl ShardIdentity {
    /// Generate a fresh identity with a new id and keypair.
    pub fn generate(capabilities: Vec<Capability>, trust_level: u8) -> Self {
        Self::with_id(ShardId::new(), capabilities, trust_level)
    }

    pub fn with_id(shard_id: ShardId, capabilities: Vec<Capability>, trust_level: u8) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = PublicKey::from_verifying_key(&signing_key.verifying_key());
        Self {
            shard_id,
            signing_key,
            public_key,
            capabilities,
            trust_level,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn trust_level(&self) -> u8 {
        self.trust_level
    }

    /// Sign `message`, returning a base64-encoded Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        STANDARD.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Check that `signature` over `message` was produced by the holder of the
    /// private key matching `sender_public_key`.
    pub fn verify(message: &[u8], signature: &str, sender_public_key: &PublicKey) -> bool {
        let Ok(verifying_key) = sender_public_key.to_verifying_key() else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(decoded.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl fmt::Debug for ShardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardIdentity")
            .field("shard_id", &self.shard_id)
            .field("public_key", &self.public_key)
            .field("capabilities", &self.capabilities)
            .field("trust_level", &self.trust_level)
            .finish_non_exhaustive()
    }
}
