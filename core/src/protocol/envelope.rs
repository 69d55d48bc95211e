//! Sync envelope and payload definitions
//!
//! Field names are explicit snake_case; the camelCase spellings emitted by
//! older mobile clients are accepted through serde aliases and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::DeviceId;
use crate::protocol::constants::ENVELOPE_VERSION;

/// Content kind carried by a clipboard payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Link,
    Image,
    File,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::Text => "text",
            ContentType::Link => "link",
            ContentType::Image => "image",
            ContentType::File => "file",
        };
        f.write_str(s)
    }
}

/// Top-level message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Clipboard,
    Control,
    Error,
}

/// The top-level wire message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub payload: SyncPayload,
}

impl SyncEnvelope {
    /// Build a clipboard envelope around an already-sealed payload
    pub fn clipboard(payload: SyncPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ENVELOPE_VERSION.to_string(),
            kind: EnvelopeType::Clipboard,
            payload,
        }
    }
}

/// Encrypted clipboard payload inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(alias = "contentType")]
    pub content_type: ContentType,
    #[serde(alias = "ciphertextB64")]
    pub ciphertext_b64: String,
    /// Sender, lowercase
    #[serde(alias = "deviceId")]
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "deviceName")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeviceId>,
    pub encryption: EncryptionInfo,
}

/// AEAD parameters for a sealed payload.
///
/// Empty nonce and tag mark the development-only plaintext mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub algorithm: String,
    #[serde(alias = "nonceB64")]
    pub nonce_b64: String,
    #[serde(alias = "tagB64")]
    pub tag_b64: String,
}

impl EncryptionInfo {
    pub const AES_256_GCM: &'static str = "AES-256-GCM";

    pub fn is_plaintext(&self) -> bool {
        self.nonce_b64.is_empty() || self.tag_b64.is_empty()
    }
}

/// Plaintext clipboard payload sealed inside an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardPayload {
    #[serde(alias = "contentType")]
    pub content_type: ContentType,
    /// Standard base64 without padding; decoded tolerantly
    #[serde(alias = "dataBase64")]
    pub data_base64: String,
    #[serde(default)]
    pub metadata: ContentMetadata,
}

/// Content metadata carried alongside the bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// Hex SHA-256 of the canonical content bytes
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Control message pushed by the relay, consumed locally and never
/// surfaced as sync traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayControlMessage {
    pub msg_type: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeviceId>,
}

impl RelayControlMessage {
    pub fn is_control(value: &serde_json::Value) -> bool {
        value.get("msg_type").and_then(|v| v.as_str()) == Some("control")
    }
}
