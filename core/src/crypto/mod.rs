//! Cryptographic primitives for Hypo
//!
//! - Ed25519 for device identity and pairing payload signatures
//! - X25519 for ECDH key agreement during pairing
//! - HKDF-SHA256 for shared key derivation
//! - AES-256-GCM for end-to-end message encryption

mod keys;
mod encryption;
pub mod serde_utils;

pub use keys::{SigningKey, VerifyingKey, StaticSecret, EphemeralSecret, PublicKey};
pub use encryption::{derive_shared_key, SealedBox, SharedKey};
