//! Hypo Core - cross-device clipboard sync fabric
//!
//! One device's half of the sync system: LAN discovery and pairing,
//! LAN/cloud WebSocket transports with failover, clipboard observation
//! with dedup, end-to-end encryption, and the coordinator that routes
//! events between clipboard, history, and peers.

pub mod clipboard;
pub mod coordinator;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod framing;
pub mod history;
pub mod identity;
pub mod pairing;
pub mod protocol;
pub mod service;
pub mod transport;

mod error;

pub use error::{Error, Result};

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the Hypo service
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the LAN WebSocket server (0 picks an ephemeral port)
    pub port: u16,
    /// Root for persisted state (identity, key store, peers, trust)
    pub data_dir: PathBuf,
    /// Display name override; defaults to the OS hostname
    pub device_name: Option<String>,
    /// Cloud relay WebSocket URL (`wss://`), if a relay is in use
    pub relay_url: Option<url::Url>,
    /// Hex SHA-256 pin for the relay certificate
    pub relay_fingerprint_sha256: Option<String>,
    /// Base URL of the relay's pairing HTTP API
    pub relay_api_url: Option<url::Url>,
    /// Development-only: accept envelopes with empty encryption fields.
    /// Never enable in user builds.
    pub allow_plaintext_sync: bool,
    /// Pasteboard polling cadence
    pub clipboard_poll_interval: Duration,
    /// Override for the discovered-peer staleness window
    pub stale_peer_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: protocol::constants::DEFAULT_PORT,
            data_dir: dirs_home().join(".hypo"),
            device_name: None,
            relay_url: None,
            relay_fingerprint_sha256: None,
            relay_api_url: None,
            allow_plaintext_sync: false,
            clipboard_poll_interval: Duration::from_millis(
                protocol::constants::CLIPBOARD_POLL_INTERVAL_MS,
            ),
            stale_peer_timeout: None,
        }
    }
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// Re-export key types for convenience
pub use clipboard::{ClipboardContent, Pasteboard};
pub use discovery::DiscoveredPeer;
pub use history::{ClipboardItem, HistoryStore, MemoryHistory, TransportOrigin};
pub use identity::{DeviceId, DeviceIdentity};
pub use protocol::SyncEnvelope;
pub use service::{HypoService, ServiceEvent};
