//! Encrypted at-rest store for per-peer shared keys and local private keys
//!
//! The store is one JSON document sealed with AES-256-GCM under a 32-byte
//! master key held in the OS keyring. Key bytes never touch disk in
//! plaintext.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::crypto::{self, SealedBox, SharedKey, SigningKey, StaticSecret};
use crate::identity::DeviceId;
use crate::{Error, Result};

/// AAD binding the sealed store file to its purpose
const STORE_AAD: &[u8] = b"hypo/keystore";

const KEYRING_SERVICE: &str = "hypo";
const KEYRING_USER: &str = "master-key";

/// 32-byte key that seals the store file, bound to the OS account
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

impl MasterKey {
    /// Fetch the master key from the OS keyring, creating one on first run
    pub fn from_os_keyring() -> Result<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
            .map_err(|e| Error::KeyStore(e.to_string()))?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| Error::KeyStore(format!("corrupt master key: {}", e)))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| Error::KeyStore("master key has wrong length".to_string()))?;
                Ok(Self(key))
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                entry
                    .set_password(&BASE64.encode(key))
                    .map_err(|e| Error::KeyStore(e.to_string()))?;
                tracing::info!("generated new key store master key");
                Ok(Self(key))
            }
            Err(e) => Err(Error::KeyStore(e.to_string())),
        }
    }

    /// Use explicit key bytes (tests, platforms without a keyring)
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Plaintext layout of the sealed store document
#[derive(Debug, Serialize, Deserialize)]
struct StoreState {
    #[serde(with = "crypto::serde_utils::base64_array_32")]
    x25519_secret: [u8; 32],
    #[serde(with = "crypto::serde_utils::base64_array_32")]
    ed25519_secret: [u8; 32],
    /// Peer id (as originally saved) -> base64 shared key
    peer_keys: HashMap<String, String>,
}

/// Envelope written to disk
#[derive(Debug, Serialize, Deserialize)]
struct SealedStore {
    nonce_b64: String,
    tag_b64: String,
    ciphertext_b64: String,
}

/// Encrypted key store: owns every [`SharedKey`] plus the device's
/// long-lived X25519 and Ed25519 secrets
pub struct KeyStore {
    path: PathBuf,
    master: SharedKey,
    state: RwLock<StoreState>,
    /// Bumped on every mutation; the coordinator watches this to catch
    /// pairings that complete after a copy event
    generation: watch::Sender<u64>,
}

impl KeyStore {
    /// Open the store at `path`, creating it (with fresh local keys) if absent
    pub fn open(path: PathBuf, master: MasterKey) -> Result<Arc<Self>> {
        let master = SharedKey::from_bytes(master.0);

        let state = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let sealed: SealedStore = serde_json::from_str(&data)?;
            let sealed_box = SealedBox {
                ciphertext: crypto::serde_utils::decode_base64_tolerant(&sealed.ciphertext_b64)?,
                nonce: decode_array(&sealed.nonce_b64)?,
                tag: decode_array(&sealed.tag_b64)?,
            };
            let plaintext = master
                .open(&sealed_box, STORE_AAD)
                .map_err(|_| Error::KeyStore("master key does not open store".to_string()))?;
            serde_json::from_slice(&plaintext)?
        } else {
            StoreState {
                x25519_secret: StaticSecret::generate().to_bytes(),
                ed25519_secret: SigningKey::generate().to_bytes(),
                peer_keys: HashMap::new(),
            }
        };

        let (generation, _) = watch::channel(0);
        let store = Arc::new(Self {
            path,
            master,
            state: RwLock::new(state),
            generation,
        });

        // Persist immediately so first-run key material survives a crash
        store.flush_blocking()?;
        Ok(store)
    }

    /// The device's long-lived X25519 secret
    pub async fn static_secret(&self) -> StaticSecret {
        StaticSecret::from_bytes(self.state.read().await.x25519_secret)
    }

    /// The device's Ed25519 signing key
    pub async fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.state.read().await.ed25519_secret)
    }

    /// Persist a shared key for a peer, overwriting any existing entry
    pub async fn save(&self, peer: &DeviceId, key: &SharedKey) -> Result<()> {
        {
            let mut state = self.state.write().await;
            // Drop any stale different-case entry for the same peer
            state
                .peer_keys
                .retain(|stored, _| !stored.eq_ignore_ascii_case(peer.as_str()));
            state
                .peer_keys
                .insert(peer.as_str().to_string(), BASE64.encode(key.to_bytes()));
            self.flush(&state)?;
        }
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Look up a peer's shared key. The lookup is case-insensitive; a hit
    /// under a different-case stored id is returned with a warning.
    pub async fn load(&self, peer: &DeviceId) -> Option<SharedKey> {
        let state = self.state.read().await;

        if let Some(encoded) = state.peer_keys.get(peer.as_str()) {
            return decode_key(encoded);
        }

        for (stored, encoded) in &state.peer_keys {
            if stored.eq_ignore_ascii_case(peer.as_str()) {
                tracing::warn!(
                    requested = %peer,
                    stored = %stored,
                    "key store id case mismatch"
                );
                return decode_key(encoded);
            }
        }

        None
    }

    /// Remove a peer's shared key
    pub async fn delete(&self, peer: &DeviceId) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state
                .peer_keys
                .retain(|stored, _| !stored.eq_ignore_ascii_case(peer.as_str()));
            self.flush(&state)?;
        }
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// All peer ids with a stored key, normalized
    pub async fn list(&self) -> Vec<DeviceId> {
        self.state
            .read()
            .await
            .peer_keys
            .keys()
            .filter_map(|id| DeviceId::normalize(id).ok())
            .collect()
    }

    /// Watch for key additions/removals
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn flush(&self, state: &StoreState) -> Result<()> {
        let plaintext = serde_json::to_vec(state)?;
        let sealed = self.master.seal(&plaintext, STORE_AAD)?;
        let doc = SealedStore {
            nonce_b64: BASE64.encode(sealed.nonce),
            tag_b64: BASE64.encode(sealed.tag),
            ciphertext_b64: BASE64.encode(&sealed.ciphertext),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Atomic replace: write sibling then rename over
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn flush_blocking(&self) -> Result<()> {
        let state = self
            .state
            .try_read()
            .map_err(|_| Error::KeyStore("store locked during open".to_string()))?;
        self.flush(&state)
    }
}

fn decode_key(encoded: &str) -> Option<SharedKey> {
    let bytes = crypto::serde_utils::decode_base64_tolerant(encoded).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(SharedKey::from_bytes(array))
}

fn decode_array<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = crypto::serde_utils::decode_base64_tolerant(encoded)?;
    bytes
        .try_into()
        .map_err(|_| Error::KeyStore("sealed store field has wrong length".to_string()))
}
