//! Pairing handshake manager
//!
//! Three entry modes share one cryptographic core. The *initiator* is the
//! device whose identity payload travels out of band (QR display, mDNS TXT
//! record, relay code); the *responder* acts on that payload, generates an
//! ephemeral X25519 key, derives the shared key, and opens the
//! challenge/ack exchange. On success both sides hold the same 32-byte
//! key under the other's normalized device id.

mod relay_api;

pub use relay_api::{ClaimGrant, CodeGrant, RelayPairingApi};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::crypto::serde_utils::{decode_base64_tolerant, encode_base64};
use crate::crypto::{derive_shared_key, EphemeralSecret, SealedBox, SharedKey, VerifyingKey};
use crate::discovery::DiscoveredPeer;
use crate::framing::encode_frame;
use crate::identity::{DeviceId, DeviceIdentity, KeyStore};
use crate::protocol::constants::{
    LAN_AUTO_DISCOVERY_SIGNATURE, PAIRING_ACK_TIMEOUT, PAIRING_CLOCK_SKEW,
};
use crate::protocol::{
    AckBody, ChallengeBody, PairingAck, PairingChallenge, PairingPayload,
};
use crate::transport::{pair_exchange, PairingReply, TransportManager};
use crate::{Error, Result};

/// QR string prefix for pairing payloads
const QR_SCHEME: &str = "hypo://pair#";

/// How long a displayed QR payload stays valid
const QR_PAYLOAD_TTL_MINUTES: i64 = 5;

/// Relay polling cadence while waiting for the counterparty
const RELAY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pairing lifecycle events surfaced to the embedding service
#[derive(Debug, Clone)]
pub enum PairingEvent {
    Completed {
        device_id: DeviceId,
        device_name: String,
    },
    Failed {
        reason: String,
    },
}

/// How the challenge/ack round-trip travels
enum PairingRoute {
    Lan { url: url::Url },
    Relay { code: String },
}

/// State for a challenge this device (as responder) has outstanding
struct OutstandingChallenge {
    peer: DeviceId,
    peer_name: String,
    shared: SharedKey,
    secret: [u8; 32],
}

/// Persisted map of peer device id to trusted Ed25519 signing key.
///
/// QR-mode signature verification anchors here; completed pairings record
/// the peer's key for future QR exchanges.
pub struct TrustStore {
    path: std::path::PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl TrustStore {
    pub fn open(path: std::path::PathBuf) -> Self {
        let entries = if path.exists() {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|data| serde_json::from_str(&data).ok())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub async fn get(&self, peer: &DeviceId) -> Option<VerifyingKey> {
        let entries = self.entries.lock().await;
        entries
            .get(peer.as_str())
            .and_then(|b64| VerifyingKey::from_base64(b64).ok())
    }

    pub async fn trust(&self, peer: &DeviceId, key: &VerifyingKey) {
        let mut entries = self.entries.lock().await;
        entries.insert(peer.as_str().to_string(), key.to_base64());

        let persist = || -> Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&*entries)?)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = persist() {
            tracing::warn!("could not persist trust store: {}", e);
        }
    }
}

/// The pairing manager
pub struct PairingManager {
    identity: DeviceIdentity,
    key_store: Arc<KeyStore>,
    transport: Arc<TransportManager>,
    trust: TrustStore,
    api: Option<RelayPairingApi>,
    lan_port: u16,
    outstanding: Mutex<HashMap<Uuid, OutstandingChallenge>>,
    events_tx: mpsc::Sender<PairingEvent>,
}

impl PairingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: DeviceIdentity,
        key_store: Arc<KeyStore>,
        transport: Arc<TransportManager>,
        trust: TrustStore,
        api: Option<RelayPairingApi>,
        lan_port: u16,
        events_tx: mpsc::Sender<PairingEvent>,
    ) -> Self {
        Self {
            identity,
            key_store,
            transport,
            trust,
            api,
            lan_port,
            outstanding: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    // ---- initiator side: publishing our identity ----

    /// Build and sign the payload shown as a QR code
    pub async fn qr_payload(&self, host: Option<String>) -> Result<PairingPayload> {
        let now = Utc::now();
        let mut payload = PairingPayload {
            version: crate::protocol::PAIRING_PAYLOAD_VERSION.to_string(),
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            public_key: self.key_store.static_secret().await.public_key(),
            signing_public_key: Some(self.key_store.signing_key().await.verifying_key()),
            host,
            port: Some(self.lan_port),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(QR_PAYLOAD_TTL_MINUTES),
            signature: String::new(),
        };
        payload.sign(&self.key_store.signing_key().await)?;
        Ok(payload)
    }

    /// Render a payload as the QR string
    pub fn qr_string(payload: &PairingPayload) -> Result<String> {
        let json = serde_json::to_vec(payload)?;
        Ok(format!(
            "{}{}",
            QR_SCHEME,
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, json)
        ))
    }

    /// Render a payload's QR string as an SVG document for embedding UIs
    pub fn qr_svg(payload: &PairingPayload) -> Result<String> {
        use qrcode::{render::svg, QrCode};

        let data = Self::qr_string(payload)?;
        let code = QrCode::new(data.as_bytes())
            .map_err(|e| Error::InvalidMessage(format!("QR generation failed: {}", e)))?;

        Ok(code
            .render::<svg::Color>()
            .min_dimensions(200, 200)
            .build())
    }

    /// Parse a scanned QR string back into a payload
    pub fn parse_qr_string(qr: &str) -> Result<PairingPayload> {
        let encoded = qr
            .strip_prefix(QR_SCHEME)
            .ok_or_else(|| Error::InvalidMessage("not a pairing QR".to_string()))?;
        let json = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            encoded,
        )
        .map_err(|e| Error::PayloadMalformed(format!("invalid QR base64: {}", e)))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Create a remote pairing code and spawn the task that answers the
    /// responder's challenge when it lands
    pub async fn create_remote_code(self: &Arc<Self>) -> Result<CodeGrant> {
        let api = self.require_api()?;
        let public_key = self.key_store.static_secret().await.public_key();

        let grant = api
            .create_code(
                &self.identity.device_id,
                &self.identity.device_name,
                &public_key.to_base64(),
            )
            .await?;

        let manager = Arc::clone(self);
        let code = grant.code.clone();
        let expires_at = grant.expires_at;
        tokio::spawn(async move {
            if let Err(e) = manager.await_remote_challenge(code, expires_at).await {
                tracing::warn!("remote pairing failed: {}", e);
                let _ = manager
                    .events_tx
                    .send(PairingEvent::Failed {
                        reason: e.to_string(),
                    })
                    .await;
            }
        });

        Ok(grant)
    }

    async fn await_remote_challenge(
        &self,
        code: String,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let api = self.require_api()?;

        loop {
            if Utc::now() >= expires_at {
                return Err(Error::HandshakeTimeout(
                    "pairing code expired unclaimed".to_string(),
                ));
            }

            if let Some(challenge) = api
                .get_challenge(&code, &self.identity.device_id)
                .await?
            {
                let ack = self.answer_challenge(&challenge).await?;
                api.post_ack(&code, &self.identity.device_id, &ack).await?;
                self.complete_as_initiator(&challenge).await;
                return Ok(());
            }

            tokio::time::sleep(RELAY_POLL_INTERVAL).await;
        }
    }

    /// Handle a pairing challenge that arrived on the LAN server;
    /// the ack goes back on the same socket
    pub async fn handle_challenge(
        &self,
        challenge: PairingChallenge,
        reply: Option<PairingReply>,
    ) -> Result<()> {
        let ack = self.answer_challenge(&challenge).await?;

        match reply {
            Some(reply) => reply.send_json(&ack).await?,
            None => {
                return Err(Error::InvalidMessage(
                    "challenge arrived without a reply path".to_string(),
                ))
            }
        }

        self.complete_as_initiator(&challenge).await;
        Ok(())
    }

    /// The initiator half of the cryptographic core: derive the shared key
    /// from our static secret and the responder's ephemeral public key,
    /// open the challenge, and build the hash ack
    async fn answer_challenge(&self, challenge: &PairingChallenge) -> Result<PairingAck> {
        let static_secret = self.key_store.static_secret().await;
        let shared = derive_shared_key(static_secret.diffie_hellman(&challenge.public_key));

        let sealed = SealedBox {
            ciphertext: decode_base64_tolerant(&challenge.ciphertext_b64)?,
            nonce: decode_fixed(&challenge.nonce_b64)?,
            tag: decode_fixed(&challenge.tag_b64)?,
        };
        // Challenge AAD is the responder's id
        let plaintext = shared.open(&sealed, challenge.device_id.as_aad())?;
        let body: ChallengeBody = serde_json::from_slice(&plaintext)?;

        let skew = ChronoDuration::from_std(PAIRING_CLOCK_SKEW).expect("skew fits chrono");
        if (Utc::now() - body.timestamp).abs() > skew {
            return Err(Error::PayloadExpired);
        }

        let secret = decode_base64_tolerant(&body.challenge_secret_b64)?;
        let response_hash = hex::encode(Sha256::digest(&secret));

        let ack_body = AckBody {
            response_hash,
            issued_at: Utc::now(),
        };
        // Ack AAD is the initiator's id (ours)
        let sealed = shared.seal(
            &serde_json::to_vec(&ack_body)?,
            self.identity.device_id.as_aad(),
        )?;

        // Persist under the responder's normalized id; the ack we are about
        // to send completes the handshake from our side
        self.key_store.save(&challenge.device_id, &shared).await?;

        Ok(PairingAck {
            challenge_id: challenge.challenge_id,
            device_id: self.identity.device_id.clone(),
            ciphertext_b64: encode_base64(&sealed.ciphertext),
            nonce_b64: encode_base64(&sealed.nonce),
            tag_b64: encode_base64(&sealed.tag),
        })
    }

    async fn complete_as_initiator(&self, challenge: &PairingChallenge) {
        self.transport
            .mark_paired(
                challenge.device_id.clone(),
                Some(challenge.device_name.clone()),
                None,
                None,
            )
            .await;

        tracing::info!(
            peer = %challenge.device_id,
            name = %challenge.device_name,
            "pairing completed (initiator side)"
        );
        let _ = self
            .events_tx
            .send(PairingEvent::Completed {
                device_id: challenge.device_id.clone(),
                device_name: challenge.device_name.clone(),
            })
            .await;
    }

    // ---- responder side: acting on a published identity ----

    /// Mode A: pair with a LAN-discovered peer. The TXT-advertised public
    /// key substitutes the QR payload; the signature carries the sentinel
    /// and verification is skipped, trust anchored in the Bonjour record.
    pub async fn pair_lan_auto(&self, peer: &DiscoveredPeer) -> Result<()> {
        let device_id = peer
            .device_id
            .clone()
            .ok_or_else(|| Error::InvalidMessage("peer has no device_id".to_string()))?;
        let public_key = peer
            .public_key
            .clone()
            .ok_or_else(|| Error::InvalidMessage("peer advertises no pub_key".to_string()))?;
        let host = peer
            .addresses
            .first()
            .ok_or_else(|| Error::InvalidMessage("peer has no addresses".to_string()))?;

        let now = Utc::now();
        let payload = PairingPayload {
            version: crate::protocol::PAIRING_PAYLOAD_VERSION.to_string(),
            device_id,
            device_name: peer.device_name.clone(),
            public_key,
            signing_public_key: peer.signing_public_key.clone(),
            host: Some(host.to_string()),
            port: Some(peer.port),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(QR_PAYLOAD_TTL_MINUTES),
            signature: LAN_AUTO_DISCOVERY_SIGNATURE.to_string(),
        };

        let url = lan_pair_url(host.to_string(), peer.port)?;
        self.respond_to_payload(payload, PairingRoute::Lan { url })
            .await
    }

    /// Mode B: pair from a scanned QR string
    pub async fn pair_via_qr(&self, qr: &str) -> Result<()> {
        let payload = Self::parse_qr_string(qr)?;

        let host = payload
            .host
            .clone()
            .ok_or_else(|| Error::InvalidMessage("QR payload has no host".to_string()))?;
        let port = payload
            .port
            .ok_or_else(|| Error::InvalidMessage("QR payload has no port".to_string()))?;
        let url = lan_pair_url(host, port)?;

        self.respond_to_payload(payload, PairingRoute::Lan { url })
            .await
    }

    /// Mode C: pair with a remote 6-digit code via the relay
    pub async fn pair_via_code(&self, code: &str) -> Result<()> {
        let api = self.require_api()?;
        let public_key = self.key_store.static_secret().await.public_key();

        let grant = api
            .claim_code(
                code,
                &self.identity.device_id,
                &self.identity.device_name,
                &public_key.to_base64(),
            )
            .await?;

        let now = Utc::now();
        let payload = PairingPayload {
            version: crate::protocol::PAIRING_PAYLOAD_VERSION.to_string(),
            device_id: grant.initiator_device_id.clone(),
            device_name: grant.initiator_device_name.clone(),
            public_key: crate::crypto::PublicKey::from_base64(&grant.initiator_public_key)?,
            signing_public_key: None,
            host: None,
            port: None,
            issued_at: now,
            expires_at: grant.expires_at,
            // Trust is anchored in possession of the code
            signature: LAN_AUTO_DISCOVERY_SIGNATURE.to_string(),
        };

        self.respond_to_payload(
            payload,
            PairingRoute::Relay {
                code: code.to_string(),
            },
        )
        .await
    }

    /// The responder half of the cryptographic core, common to all modes
    async fn respond_to_payload(
        &self,
        payload: PairingPayload,
        route: PairingRoute,
    ) -> Result<()> {
        payload.validate(Utc::now())?;

        if !payload.is_lan_auto_discovery() {
            // QR mode verifies against a pre-established bootstrap signing
            // key, never the key embedded in the payload itself
            let trusted = self
                .trust
                .get(&payload.device_id)
                .await
                .ok_or_else(|| Error::Untrusted(payload.device_id.to_string()))?;
            payload.verify_signature(&trusted)?;
        }

        // Fresh ephemeral keypair and shared key for this handshake
        let ephemeral = EphemeralSecret::generate();
        let ephemeral_public = ephemeral.public_key();
        let shared = derive_shared_key(ephemeral.diffie_hellman(&payload.public_key));

        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);

        let body = ChallengeBody {
            challenge_secret_b64: encode_base64(&secret),
            timestamp: Utc::now(),
        };
        // Challenge AAD is our (responder) id
        let sealed = shared.seal(
            &serde_json::to_vec(&body)?,
            self.identity.device_id.as_aad(),
        )?;

        let challenge = PairingChallenge {
            challenge_id: Uuid::new_v4(),
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            public_key: ephemeral_public,
            ciphertext_b64: encode_base64(&sealed.ciphertext),
            nonce_b64: encode_base64(&sealed.nonce),
            tag_b64: encode_base64(&sealed.tag),
        };

        self.outstanding.lock().await.insert(
            challenge.challenge_id,
            OutstandingChallenge {
                peer: payload.device_id.clone(),
                peer_name: payload.device_name.clone(),
                shared: shared.clone(),
                secret,
            },
        );

        let result = self.run_route(&payload, &challenge, route).await;

        // Outstanding state is one-shot either way; pairing never retries
        self.outstanding.lock().await.remove(&challenge.challenge_id);

        match result {
            Ok(()) => {
                if let Some(signing_key) = &payload.signing_public_key {
                    self.trust.trust(&payload.device_id, signing_key).await;
                }
                let _ = self
                    .events_tx
                    .send(PairingEvent::Completed {
                        device_id: payload.device_id.clone(),
                        device_name: payload.device_name.clone(),
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .events_tx
                    .send(PairingEvent::Failed {
                        reason: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn run_route(
        &self,
        payload: &PairingPayload,
        challenge: &PairingChallenge,
        route: PairingRoute,
    ) -> Result<()> {
        let ack = match route {
            PairingRoute::Lan { url } => {
                let frame = encode_frame(&serde_json::to_vec(challenge)?)?;
                let reply = pair_exchange(url, None, self.identity.device_id.clone(), frame)
                    .await?;
                let value: serde_json::Value = serde_json::from_slice(&reply)
                    .map_err(|e| Error::PayloadMalformed(e.to_string()))?;
                serde_json::from_value::<PairingAck>(value)?
            }
            PairingRoute::Relay { code } => {
                let api = self.require_api()?;
                api.post_challenge(&code, &self.identity.device_id, challenge)
                    .await?;

                let deadline = tokio::time::Instant::now() + PAIRING_ACK_TIMEOUT;
                loop {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::HandshakeTimeout(
                            "no ack before deadline".to_string(),
                        ));
                    }
                    if let Some(ack) = api.get_ack(&code, &self.identity.device_id).await? {
                        break ack;
                    }
                    tokio::time::sleep(RELAY_POLL_INTERVAL).await;
                }
            }
        };

        self.verify_ack(payload, challenge.challenge_id, &ack).await
    }

    /// Handle an ack that arrived out of band (e.g. on the LAN server
    /// instead of the dial-out socket)
    pub async fn handle_ack(&self, ack: PairingAck) -> Result<()> {
        let outstanding = {
            let guard = self.outstanding.lock().await;
            guard.get(&ack.challenge_id).map(|o| {
                (
                    o.peer.clone(),
                    o.peer_name.clone(),
                    o.shared.clone(),
                    o.secret,
                )
            })
        };

        let Some((peer, peer_name, shared, secret)) = outstanding else {
            return Err(Error::InvalidMessage(format!(
                "no outstanding challenge {}",
                ack.challenge_id
            )));
        };

        verify_ack_body(&shared, &secret, &peer, &ack)?;
        self.outstanding.lock().await.remove(&ack.challenge_id);

        self.key_store.save(&peer, &shared).await?;
        self.transport
            .mark_paired(peer.clone(), Some(peer_name.clone()), None, None)
            .await;

        let _ = self
            .events_tx
            .send(PairingEvent::Completed {
                device_id: peer,
                device_name: peer_name,
            })
            .await;
        Ok(())
    }

    async fn verify_ack(
        &self,
        payload: &PairingPayload,
        challenge_id: Uuid,
        ack: &PairingAck,
    ) -> Result<()> {
        if ack.challenge_id != challenge_id {
            return Err(Error::ChallengeMismatch);
        }
        if ack.device_id != payload.device_id {
            return Err(Error::ChallengeMismatch);
        }

        let (shared, secret) = {
            let guard = self.outstanding.lock().await;
            let outstanding = guard
                .get(&challenge_id)
                .ok_or(Error::ChallengeMismatch)?;
            (outstanding.shared.clone(), outstanding.secret)
        };

        verify_ack_body(&shared, &secret, &payload.device_id, ack)?;

        // Both sides persist under the other's normalized id
        self.key_store.save(&payload.device_id, &shared).await?;
        self.transport
            .mark_paired(
                payload.device_id.clone(),
                Some(payload.device_name.clone()),
                Some(payload.public_key.clone()),
                payload.signing_public_key.clone(),
            )
            .await;

        tracing::info!(
            peer = %payload.device_id,
            name = %payload.device_name,
            "pairing completed (responder side)"
        );
        Ok(())
    }

    /// Explicit unpair: destroy the shared key and the peer record
    pub async fn unpair(&self, peer: &DeviceId) -> Result<()> {
        self.key_store.delete(peer).await?;
        self.transport.unpair(peer).await;
        tracing::info!(peer = %peer, "unpaired");
        Ok(())
    }

    fn require_api(&self) -> Result<&RelayPairingApi> {
        self.api.as_ref().ok_or_else(|| {
            Error::Network("no relay configured for remote pairing".to_string())
        })
    }
}

/// Decrypt and check an ack body against the challenge secret
fn verify_ack_body(
    shared: &SharedKey,
    secret: &[u8; 32],
    initiator: &DeviceId,
    ack: &PairingAck,
) -> Result<()> {
    let sealed = SealedBox {
        ciphertext: decode_base64_tolerant(&ack.ciphertext_b64)?,
        nonce: decode_fixed(&ack.nonce_b64)?,
        tag: decode_fixed(&ack.tag_b64)?,
    };
    // Ack AAD is the initiator's id
    let plaintext = shared.open(&sealed, initiator.as_aad())?;
    let body: AckBody = serde_json::from_slice(&plaintext)?;

    let expected = hex::encode(Sha256::digest(secret));
    if body.response_hash != expected {
        return Err(Error::ChallengeMismatch);
    }

    let skew = ChronoDuration::from_std(PAIRING_CLOCK_SKEW).expect("skew fits chrono");
    if (Utc::now() - body.issued_at).abs() > skew {
        return Err(Error::PayloadExpired);
    }

    Ok(())
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = decode_base64_tolerant(encoded)?;
    bytes
        .try_into()
        .map_err(|_| Error::PayloadMalformed(format!("field is not {} bytes", N)))
}

fn lan_pair_url(host: String, port: u16) -> Result<url::Url> {
    let rendered = if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{}]:{}/sync", host, port)
    } else {
        format!("ws://{}:{}/sync", host, port)
    };
    url::Url::parse(&rendered).map_err(|e| Error::Network(e.to_string()))
}
