//! Pairing handshake message definitions
//!
//! These travel as raw JSON (QR codes, LAN sockets, relay HTTP bodies),
//! never inside sync envelopes. The inbound server tells them apart from
//! sync traffic by the top-level `challenge_id` field.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{PublicKey, SigningKey, VerifyingKey};
use crate::identity::DeviceId;
use crate::protocol::constants::{LAN_AUTO_DISCOVERY_SIGNATURE, PAIRING_CLOCK_SKEW};
use crate::{Error, Result};

/// Version accepted for pairing payloads
pub const PAIRING_PAYLOAD_VERSION: &str = "1";

/// Grace applied behind `issued_at` before a payload counts as not-yet-valid
const ISSUED_AT_GRACE_SECS: i64 = 60;

/// Identity payload presented by the pairing initiator.
///
/// Displayed as a QR code, synthesized from mDNS TXT attributes in LAN
/// auto-discovery mode, or returned by the relay claim endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPayload {
    pub version: String,
    pub device_id: DeviceId,
    pub device_name: String,
    /// Initiator's long-lived X25519 public key
    #[serde(alias = "publicKey")]
    pub public_key: PublicKey,
    /// Absent only in relay code mode, where trust rides on the code
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "signingPublicKey"
    )]
    pub signing_public_key: Option<VerifyingKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(alias = "issuedAt")]
    pub issued_at: DateTime<Utc>,
    #[serde(alias = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    /// Base64 Ed25519 signature over the payload with this field blanked,
    /// or the LAN auto-discovery sentinel
    pub signature: String,
}

impl PairingPayload {
    /// Bytes the Ed25519 signature covers: the payload serialized with the
    /// signature field blanked
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign in place with the initiator's long-term signing key
    pub fn sign(&mut self, key: &SigningKey) -> Result<()> {
        self.signature = String::new();
        let bytes = self.signable_bytes()?;
        self.signature = crate::crypto::serde_utils::encode_base64(&key.sign(&bytes));
        Ok(())
    }

    /// True when the signature carries the LAN auto-discovery sentinel and
    /// trust is anchored in the Bonjour TXT record instead
    pub fn is_lan_auto_discovery(&self) -> bool {
        self.signature == LAN_AUTO_DISCOVERY_SIGNATURE
    }

    /// Verify the Ed25519 signature against a trusted verifying key
    pub fn verify_signature(&self, trusted: &VerifyingKey) -> Result<()> {
        if self.is_lan_auto_discovery() {
            return Err(Error::SignatureInvalid(
                "sentinel signature is not verifiable".to_string(),
            ));
        }
        let signature = crate::crypto::serde_utils::decode_base64_tolerant(&self.signature)?;
        trusted.verify(&self.signable_bytes()?, &signature)
    }

    /// Check version and validity window: `expires_at > now >= issued_at - 60 s`,
    /// with clock skew tolerated on both edges
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.version != PAIRING_PAYLOAD_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported pairing payload version: {}",
                self.version
            )));
        }

        let skew = ChronoDuration::from_std(PAIRING_CLOCK_SKEW)
            .expect("clock skew fits in chrono range");
        let grace = ChronoDuration::seconds(ISSUED_AT_GRACE_SECS);

        if now + skew < self.issued_at - grace {
            return Err(Error::PayloadExpired);
        }
        if now - skew >= self.expires_at {
            return Err(Error::PayloadExpired);
        }
        Ok(())
    }
}

/// Step 2 of the handshake: the responder's challenge.
///
/// `ciphertext` seals a [`ChallengeBody`] under the freshly derived shared
/// key with the responder's id as AAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingChallenge {
    pub challenge_id: Uuid,
    /// Responder, lowercase
    pub device_id: DeviceId,
    pub device_name: String,
    /// Responder's ephemeral X25519 public key
    pub public_key: PublicKey,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    pub tag_b64: String,
}

/// Plaintext body of a pairing challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeBody {
    /// 32 random bytes, base64
    pub challenge_secret_b64: String,
    pub timestamp: DateTime<Utc>,
}

/// Step 3 of the handshake: the initiator's acknowledgement.
///
/// `ciphertext` seals an [`AckBody`] under the shared key with the
/// initiator's id as AAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingAck {
    pub challenge_id: Uuid,
    /// Initiator, lowercase
    pub device_id: DeviceId,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    pub tag_b64: String,
}

/// Plaintext body of a pairing ack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBody {
    /// Hex SHA-256 of the challenge secret
    pub response_hash: String,
    pub issued_at: DateTime<Utc>,
}

/// A pairing frame as pulled off a socket
#[derive(Debug, Clone)]
pub enum PairingMessage {
    Challenge(PairingChallenge),
    Ack(PairingAck),
}

impl PairingMessage {
    /// True when the raw JSON is a pairing frame rather than a sync envelope
    pub fn is_pairing_frame(value: &serde_json::Value) -> bool {
        value.get("challenge_id").is_some()
    }

    /// Classify and parse a raw pairing frame. Challenges carry the
    /// responder's ephemeral public key; acks do not.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.get("public_key").is_some() {
            Ok(PairingMessage::Challenge(serde_json::from_value(value)?))
        } else {
            Ok(PairingMessage::Ack(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticSecret;

    fn sample_payload(now: DateTime<Utc>) -> PairingPayload {
        PairingPayload {
            version: PAIRING_PAYLOAD_VERSION.to_string(),
            device_id: DeviceId::generate(),
            device_name: "laptop".to_string(),
            public_key: StaticSecret::generate().public_key(),
            signing_public_key: Some(SigningKey::generate().verifying_key()),
            host: Some("192.168.1.10".to_string()),
            port: Some(7010),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(5),
            signature: String::new(),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let signing = SigningKey::generate();
        let mut payload = sample_payload(Utc::now());
        payload.sign(&signing).unwrap();

        payload.verify_signature(&signing.verifying_key()).unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let mut payload = sample_payload(Utc::now());
        payload.sign(&SigningKey::generate()).unwrap();

        let other = SigningKey::generate().verifying_key();
        assert!(matches!(
            payload.verify_signature(&other),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_field() {
        let signing = SigningKey::generate();
        let mut payload = sample_payload(Utc::now());
        payload.sign(&signing).unwrap();
        payload.device_name = "evil".to_string();

        assert!(payload.verify_signature(&signing.verifying_key()).is_err());
    }

    #[test]
    fn test_validate_window() {
        let now = Utc::now();
        let payload = sample_payload(now);
        payload.validate(now).unwrap();

        // Expired beyond skew
        let stale = now + ChronoDuration::minutes(11);
        assert!(matches!(
            payload.validate(stale),
            Err(Error::PayloadExpired)
        ));

        // Not yet valid beyond skew and grace
        let early = now - ChronoDuration::minutes(7);
        assert!(matches!(
            payload.validate(early),
            Err(Error::PayloadExpired)
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let now = Utc::now();
        let mut payload = sample_payload(now);
        payload.version = "2".to_string();
        assert!(payload.validate(now).is_err());
    }

    #[test]
    fn test_lan_sentinel_detection() {
        let mut payload = sample_payload(Utc::now());
        payload.signature = LAN_AUTO_DISCOVERY_SIGNATURE.to_string();
        assert!(payload.is_lan_auto_discovery());
    }

    #[test]
    fn test_pairing_frame_classification() {
        let challenge = PairingChallenge {
            challenge_id: Uuid::new_v4(),
            device_id: DeviceId::generate(),
            device_name: "phone".to_string(),
            public_key: StaticSecret::generate().public_key(),
            ciphertext_b64: "YQ".to_string(),
            nonce_b64: "YQ".to_string(),
            tag_b64: "YQ".to_string(),
        };
        let value = serde_json::to_value(&challenge).unwrap();
        assert!(PairingMessage::is_pairing_frame(&value));
        assert!(matches!(
            PairingMessage::from_value(value).unwrap(),
            PairingMessage::Challenge(_)
        ));

        let ack = PairingAck {
            challenge_id: Uuid::new_v4(),
            device_id: DeviceId::generate(),
            ciphertext_b64: "YQ".to_string(),
            nonce_b64: "YQ".to_string(),
            tag_b64: "YQ".to_string(),
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert!(matches!(
            PairingMessage::from_value(value).unwrap(),
            PairingMessage::Ack(_)
        ));
    }
}
