use thiserror::Error;

/// Hypo error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("No shared key for peer {0}")]
    MissingKey(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Malformed payload: {0}")]
    PayloadMalformed(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("No transport available for peer {0}")]
    TransportUnavailable(String),

    #[error("Pairing handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Challenge response mismatch")]
    ChallengeMismatch,

    #[error("Pairing payload expired or not yet valid")]
    PayloadExpired,

    #[error("No trusted signing key for device {0}")]
    Untrusted(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Device not paired: {0}")]
    NotPaired(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
