//! Centralized protocol constants
//!
//! All protocol-level constants are defined here to ensure consistency
//! across the codebase and make configuration easier.

use std::time::Duration;

/// Default port for the LAN WebSocket server
pub const DEFAULT_PORT: u16 = 7010;

/// mDNS service type for discovery
pub const SERVICE_TYPE: &str = "_hypo._tcp.local.";

/// Envelope schema version
pub const ENVELOPE_VERSION: &str = "1.0";

/// Protocols advertised in the `protocols` TXT attribute
pub const ADVERTISED_PROTOCOLS: &str = "ws,wss";

/// Info string for HKDF-SHA256 shared key derivation
pub const PAIRING_HKDF_INFO: &[u8] = b"hypo/pairing";

/// Signature sentinel for LAN auto-discovery pairing payloads
pub const LAN_AUTO_DISCOVERY_SIGNATURE: &str = "LAN_AUTO_DISCOVERY";

/// Maximum on-wire frame payload (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum image body after compression (1 MiB)
pub const MAX_IMAGE_SIZE: usize = 1024 * 1024;

/// Maximum file size accepted for transfer (10 MiB)
pub const MAX_FILE_TRANSFER_SIZE: usize = 10 * 1024 * 1024;

/// Maximum file size kept as a local history copy (50 MiB)
pub const MAX_FILE_LOCAL_SIZE: usize = 50 * 1024 * 1024;

/// History preview length in characters
pub const PREVIEW_MAX_CHARS: usize = 100;

/// LAN socket connect timeout
pub const LAN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloud TLS + WebSocket handshake timeout
pub const CLOUD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Wait for the per-connection handshake signal before draining the queue
pub const HANDSHAKE_SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// LAN dial budget when selecting a transport for a send
pub const LAN_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Pairing ack wait
pub const PAIRING_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Tolerated clock skew when validating pairing timestamps
pub const PAIRING_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Relay application ping interval
pub const RELAY_PING_INTERVAL: Duration = Duration::from_secs(20);

/// LAN application ping interval
pub const LAN_PING_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Relay reconnect backoff schedule cap (1, 2, 4, ... then capped)
pub const RELAY_BACKOFF_CAP: Duration = Duration::from_secs(128);

/// Per-envelope outbound retry attempts
pub const SEND_RETRY_ATTEMPTS: u32 = 8;

/// Per-envelope outbound wall-clock retry budget
pub const SEND_RETRY_BUDGET: Duration = Duration::from_secs(10 * 60);

/// Outbound queue capacity per connection
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Peers unseen for longer than this are pruned from the auto set
pub const STALE_PEER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long the coordinator waits for targets to appear after pairing
pub const EMPTY_TARGET_WAIT: Duration = Duration::from_secs(10);

/// Maximum parallel fan-out sends
pub const MAX_FANOUT_CONCURRENCY: usize = 16;

/// Clipboard polling interval in milliseconds
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;

/// Platform identifier sent in the `X-Device-Platform` handshake header
pub fn local_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_os = "ios") {
        "ios"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}
