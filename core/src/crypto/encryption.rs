//! Symmetric encryption using AES-256-GCM with additional authenticated data

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::protocol::constants::PAIRING_HKDF_INFO;
use crate::{Error, Result};

/// AES-GCM authentication tag length in bytes (128-bit tags)
const TAG_LEN: usize = 16;

/// Output of a seal operation: ciphertext with detached nonce and tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub tag: [u8; 16],
}

/// 32-byte symmetric key shared with one paired peer
#[derive(Clone)]
pub struct SharedKey {
    bytes: [u8; 32],
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey").finish_non_exhaustive()
    }
}

impl SharedKey {
    /// Create a shared key from raw bytes (for persistence)
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&bytes).expect("32 bytes is a valid key length");
        Self { bytes, cipher }
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Export as raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Seal plaintext with a fresh random nonce, binding `aad` into the tag
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut combined = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

        // aes-gcm appends the 16-byte tag to the ciphertext
        let split = combined.len() - TAG_LEN;
        let tag_bytes = combined.split_off(split);
        let tag: [u8; 16] = tag_bytes
            .try_into()
            .expect("GCM tag is always 16 bytes");

        Ok(SealedBox {
            ciphertext: combined,
            nonce: nonce_bytes,
            tag,
        })
    }

    /// Open a sealed box; fails on any authentication mismatch
    pub fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&sealed.nonce);

        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.tag);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| Error::DecryptionFailed("authentication failed".to_string()))
    }
}

/// Derive the 32-byte shared key from an X25519 ECDH output.
///
/// HKDF-SHA256 with an all-zero 32-byte salt and a fixed info string, so
/// both sides of a pairing handshake arrive at the same key.
pub fn derive_shared_key(ecdh_output: [u8; 32]) -> SharedKey {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), &ecdh_output);
    let mut okm = [0u8; 32];
    hk.expand(PAIRING_HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SharedKey::from_bytes(okm)
}
