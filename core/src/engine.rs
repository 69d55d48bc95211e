//! Sync engine: envelope build/decode with end-to-end encryption
//!
//! Outbound: serialize the plaintext payload, seal it under the target's
//! shared key with the sender id as AAD, wrap in an envelope, frame, and
//! hand to the transport manager. Inbound: the reverse, with a
//! development-only plaintext escape hatch that is never on by default.

use std::sync::Arc;

use crate::clipboard::ClipboardContent;
use crate::crypto::serde_utils::{decode_base64_tolerant, encode_base64};
use crate::crypto::SealedBox;
use crate::framing::encode_frame;
use crate::identity::{DeviceId, KeyStore};
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::{ClipboardPayload, EncryptionInfo, SyncEnvelope, SyncPayload};
use crate::transport::{TransportKind, TransportManager};
use crate::{Error, Result};

/// A decrypted incoming clipboard message
#[derive(Debug, Clone)]
pub struct IncomingClipboard {
    pub sender: DeviceId,
    pub sender_name: Option<String>,
    pub content: ClipboardContent,
    pub payload: ClipboardPayload,
}

/// Envelope encode/decode plus dispatch
pub struct SyncEngine {
    local_id: DeviceId,
    local_name: String,
    key_store: Arc<KeyStore>,
    transport: Arc<TransportManager>,
    allow_plaintext: bool,
}

impl SyncEngine {
    pub fn new(
        local_id: DeviceId,
        local_name: String,
        key_store: Arc<KeyStore>,
        transport: Arc<TransportManager>,
        allow_plaintext: bool,
    ) -> Self {
        Self {
            local_id,
            local_name,
            key_store,
            transport,
            allow_plaintext,
        }
    }

    /// Seal `content` for `target` and hand the frame to the transport
    /// manager. Returns the transport that carried it.
    pub async fn send(
        &self,
        content: &ClipboardContent,
        target: &DeviceId,
    ) -> Result<TransportKind> {
        let key = self
            .key_store
            .load(target)
            .await
            .ok_or_else(|| Error::MissingKey(target.to_string()))?;

        if !content.transferable() {
            return Err(Error::PayloadTooLarge {
                size: content.size(),
                max: MAX_FRAME_SIZE,
            });
        }

        let payload = content.to_payload();
        let plaintext = serde_json::to_vec(&payload)?;
        let sealed = key.seal(&plaintext, self.local_id.as_aad())?;

        let envelope = SyncEnvelope::clipboard(SyncPayload {
            content_type: content.content_type(),
            ciphertext_b64: encode_base64(&sealed.ciphertext),
            device_id: self.local_id.clone(),
            device_name: Some(self.local_name.clone()),
            target: Some(target.clone()),
            encryption: EncryptionInfo {
                algorithm: EncryptionInfo::AES_256_GCM.to_string(),
                nonce_b64: encode_base64(&sealed.nonce),
                tag_b64: encode_base64(&sealed.tag),
            },
        });

        let bytes = serde_json::to_vec(&envelope)?;
        // encode_frame enforces the wire cap; no retry on rejection
        let frame = encode_frame(&bytes)?;

        self.transport.send_frame(target, frame).await
    }

    /// Open an incoming envelope.
    ///
    /// Envelopes whose sender id equals the local id are loopback and
    /// rejected before any key lookup.
    pub async fn decode(&self, envelope: &SyncEnvelope) -> Result<IncomingClipboard> {
        let sender = envelope.payload.device_id.clone();
        if sender == self.local_id {
            return Err(Error::InvalidMessage("loopback envelope".to_string()));
        }

        let key = self
            .key_store
            .load(&sender)
            .await
            .ok_or_else(|| Error::MissingKey(sender.to_string()))?;

        let ciphertext = decode_base64_tolerant(&envelope.payload.ciphertext_b64)?;

        let plaintext = if envelope.payload.encryption.is_plaintext() {
            if !self.allow_plaintext {
                return Err(Error::DecryptionFailed(
                    "plaintext sync is disabled".to_string(),
                ));
            }
            tracing::warn!(sender = %sender, "accepting plaintext envelope (debug mode)");
            ciphertext
        } else {
            let sealed = SealedBox {
                ciphertext,
                nonce: decode_fixed(&envelope.payload.encryption.nonce_b64)?,
                tag: decode_fixed(&envelope.payload.encryption.tag_b64)?,
            };
            key.open(&sealed, sender.as_aad())?
        };

        let payload: ClipboardPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::PayloadMalformed(format!("payload is not valid JSON: {}", e)))?;
        let content = ClipboardContent::from_payload(&payload)?;

        Ok(IncomingClipboard {
            sender,
            sender_name: envelope.payload.device_name.clone(),
            content,
            payload,
        })
    }
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = decode_base64_tolerant(encoded)?;
    bytes.try_into().map_err(|_| {
        Error::PayloadMalformed(format!("encryption field is not {} bytes", N))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedKey;
    use crate::discovery::DiscoveryService;
    use crate::identity::MasterKey;
    use std::path::PathBuf;

    struct Fixture {
        engine: SyncEngine,
        key_store: Arc<KeyStore>,
        dir: PathBuf,
    }

    fn fixture(local_id: DeviceId, allow_plaintext: bool) -> Fixture {
        let dir = std::env::temp_dir().join(format!("hypo-engine-{}", uuid::Uuid::new_v4()));
        let key_store = KeyStore::open(
            dir.join("keystore.enc"),
            MasterKey::from_bytes([3u8; 32]),
        )
        .unwrap();

        let discovery = Arc::new(DiscoveryService::new(local_id.clone()).unwrap());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let transport = TransportManager::new(
            local_id.clone(),
            discovery,
            None,
            tx,
            dir.join("peers.json"),
            None,
        );

        let engine = SyncEngine::new(
            local_id,
            "test-device".to_string(),
            key_store.clone(),
            transport,
            allow_plaintext,
        );
        Fixture {
            engine,
            key_store,
            dir,
        }
    }

    /// Seal content the way a remote sender would
    fn seal_as_sender(
        sender: &DeviceId,
        key: &SharedKey,
        content: &ClipboardContent,
    ) -> SyncEnvelope {
        let plaintext = serde_json::to_vec(&content.to_payload()).unwrap();
        let sealed = key.seal(&plaintext, sender.as_aad()).unwrap();
        SyncEnvelope::clipboard(SyncPayload {
            content_type: content.content_type(),
            ciphertext_b64: encode_base64(&sealed.ciphertext),
            device_id: sender.clone(),
            device_name: Some("remote".to_string()),
            target: None,
            encryption: EncryptionInfo {
                algorithm: EncryptionInfo::AES_256_GCM.to_string(),
                nonce_b64: encode_base64(&sealed.nonce),
                tag_b64: encode_base64(&sealed.tag),
            },
        })
    }

    #[tokio::test]
    async fn test_decode_roundtrip() {
        let local = DeviceId::generate();
        let sender = DeviceId::generate();
        let f = fixture(local, false);

        let key = SharedKey::generate();
        f.key_store.save(&sender, &key).await.unwrap();

        let content = ClipboardContent::Text("Test from A".to_string());
        let envelope = seal_as_sender(&sender, &key, &content);

        let incoming = f.engine.decode(&envelope).await.unwrap();
        assert_eq!(incoming.content, content);
        assert_eq!(incoming.sender, sender);
        assert_eq!(incoming.payload.metadata.hash, content.hash_hex());
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_decode_missing_key() {
        let f = fixture(DeviceId::generate(), false);
        let sender = DeviceId::generate();

        let envelope = seal_as_sender(
            &sender,
            &SharedKey::generate(),
            &ClipboardContent::Text("x".to_string()),
        );

        assert!(matches!(
            f.engine.decode(&envelope).await,
            Err(Error::MissingKey(_))
        ));
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_decode_wrong_key_fails_auth() {
        let f = fixture(DeviceId::generate(), false);
        let sender = DeviceId::generate();

        // Store a different key than the one that sealed the message
        f.key_store
            .save(&sender, &SharedKey::generate())
            .await
            .unwrap();
        let envelope = seal_as_sender(
            &sender,
            &SharedKey::generate(),
            &ClipboardContent::Text("x".to_string()),
        );

        assert!(matches!(
            f.engine.decode(&envelope).await,
            Err(Error::DecryptionFailed(_))
        ));
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_decode_rejects_loopback() {
        let local = DeviceId::generate();
        let f = fixture(local.clone(), false);

        let envelope = seal_as_sender(
            &local,
            &SharedKey::generate(),
            &ClipboardContent::Text("echo".to_string()),
        );

        assert!(f.engine.decode(&envelope).await.is_err());
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_plaintext_mode_gated() {
        let sender = DeviceId::generate();
        let key = SharedKey::generate();

        let make_plaintext_envelope = || {
            let content = ClipboardContent::Text("debug".to_string());
            let plaintext = serde_json::to_vec(&content.to_payload()).unwrap();
            SyncEnvelope::clipboard(SyncPayload {
                content_type: content.content_type(),
                ciphertext_b64: encode_base64(&plaintext),
                device_id: sender.clone(),
                device_name: None,
                target: None,
                encryption: EncryptionInfo {
                    algorithm: EncryptionInfo::AES_256_GCM.to_string(),
                    nonce_b64: String::new(),
                    tag_b64: String::new(),
                },
            })
        };

        // Disabled (the default): rejected
        let f = fixture(DeviceId::generate(), false);
        f.key_store.save(&sender, &key).await.unwrap();
        assert!(matches!(
            f.engine.decode(&make_plaintext_envelope()).await,
            Err(Error::DecryptionFailed(_))
        ));
        std::fs::remove_dir_all(f.dir).ok();

        // Explicitly enabled: accepted
        let f = fixture(DeviceId::generate(), true);
        f.key_store.save(&sender, &key).await.unwrap();
        let incoming = f.engine.decode(&make_plaintext_envelope()).await.unwrap();
        assert_eq!(
            incoming.content,
            ClipboardContent::Text("debug".to_string())
        );
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_send_missing_key() {
        let f = fixture(DeviceId::generate(), false);
        let target = DeviceId::generate();

        let result = f
            .engine
            .send(&ClipboardContent::Text("hi".to_string()), &target)
            .await;
        assert!(matches!(result, Err(Error::MissingKey(_))));
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_file() {
        use crate::clipboard::FileContent;
        use crate::protocol::constants::MAX_FILE_TRANSFER_SIZE;

        let f = fixture(DeviceId::generate(), false);
        let target = DeviceId::generate();
        f.key_store
            .save(&target, &SharedKey::generate())
            .await
            .unwrap();

        let content = ClipboardContent::File(FileContent {
            bytes: vec![0u8; MAX_FILE_TRANSFER_SIZE + 1],
            filename: "big.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });

        assert!(matches!(
            f.engine.send(&content, &target).await,
            Err(Error::PayloadTooLarge { .. })
        ));
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_decode_tolerates_padded_base64() {
        let local = DeviceId::generate();
        let sender = DeviceId::generate();
        let f = fixture(local, false);

        let key = SharedKey::generate();
        f.key_store.save(&sender, &key).await.unwrap();

        let content = ClipboardContent::Text("padded".to_string());
        let mut envelope = seal_as_sender(&sender, &key, &content);
        // Re-encode the nonce with padding; decode must tolerate both
        let nonce = decode_base64_tolerant(&envelope.payload.encryption.nonce_b64).unwrap();
        envelope.payload.encryption.nonce_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &nonce);

        let incoming = f.engine.decode(&envelope).await.unwrap();
        assert_eq!(incoming.content, content);
        std::fs::remove_dir_all(f.dir).ok();
    }
}
