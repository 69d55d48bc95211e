//! Key management for device identity and key agreement

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{
    Signature, Signer, SigningKey as Ed25519SigningKey, Verifier,
    VerifyingKey as Ed25519VerifyingKey,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::{Error, Result};

/// Ed25519 signing key for device identity
#[derive(Clone)]
pub struct SigningKey {
    inner: Ed25519SigningKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.verifying_key().to_base64())
            .finish()
    }
}

impl SigningKey {
    /// Generate a new random signing key
    pub fn generate() -> Self {
        Self {
            inner: Ed25519SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: Ed25519SigningKey::from_bytes(bytes),
        }
    }

    /// Export as raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the corresponding verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.sign(message).to_bytes().to_vec()
    }
}

/// Ed25519 verifying (public) key
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: Ed25519VerifyingKey,
}

// Serialized as a bare base64 string (not a struct)
impl Serialize for VerifyingKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for VerifyingKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        VerifyingKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("bytes", &self.to_base64())
            .finish()
    }
}

impl VerifyingKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        Ok(Self {
            inner: Ed25519VerifyingKey::from_bytes(bytes)
                .map_err(|e| Error::Crypto(e.to_string()))?,
        })
    }

    /// Parse from a base64 string
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = crate::crypto::serde_utils::decode_base64_tolerant(s)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("invalid verifying key length".to_string()))?;
        Self::from_bytes(&array)
    }

    /// Export as raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Encode as a base64 string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.inner.as_bytes())
    }

    /// Verify an Ed25519 signature over a message
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::SignatureInvalid("invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.inner
            .verify(message, &sig)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }
}

/// Long-lived X25519 secret, generated once per device and persisted encrypted.
///
/// Its public half is advertised over mDNS (`pub_key` TXT attribute) and
/// anchors LAN auto-discovery pairing.
#[derive(Clone)]
pub struct StaticSecret {
    inner: X25519Secret,
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecret").finish_non_exhaustive()
    }
}

impl StaticSecret {
    /// Generate a new random secret
    pub fn generate() -> Self {
        Self {
            inner: X25519Secret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: X25519Secret::from(bytes),
        }
    }

    /// Export as raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: X25519Public::from(&self.inner),
        }
    }

    /// Perform ECDH key agreement
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        self.inner.diffie_hellman(&their_public.inner).to_bytes()
    }
}

/// One-shot X25519 secret used by the responder side of a pairing handshake
pub struct EphemeralSecret {
    inner: X25519Secret,
}

impl EphemeralSecret {
    /// Generate a new ephemeral secret
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            inner: X25519Secret::from(bytes),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: X25519Public::from(&self.inner),
        }
    }

    /// Perform ECDH key agreement, consuming the secret
    pub fn diffie_hellman(self, their_public: &PublicKey) -> [u8; 32] {
        self.inner.diffie_hellman(&their_public.inner).to_bytes()
    }
}

/// X25519 public key for ECDH
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: X25519Public,
}

// Serialized as a bare base64 string (not a struct)
impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        PublicKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("bytes", &self.to_base64())
            .finish()
    }
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: X25519Public::from(bytes),
        }
    }

    /// Parse from a base64 string
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = crate::crypto::serde_utils::decode_base64_tolerant(s)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("invalid public key length".to_string()))?;
        Ok(Self::from_bytes(array))
    }

    /// Export as raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.inner.as_bytes()
    }

    /// Encode as a base64 string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.inner.as_bytes())
    }

    /// Hex SHA-256 digest of the raw key, advertised in TXT and used
    /// for certificate pinning display
    pub fn fingerprint_sha256(&self) -> String {
        let digest = Sha256::digest(self.inner.as_bytes());
        hex::encode(digest)
    }
}
