//! Transports: LAN WebSocket client/server, cloud relay client, and the
//! manager that multiplexes them

pub mod lan;
pub mod manager;
pub mod relay;
pub mod server;
mod tls;

pub use lan::{pair_exchange, LanConnection, LanState};
pub use manager::{PeerRecord, TransportManager};
pub use relay::{RelayClient, RelayConfig};
pub use server::{LanServer, LanServerHandle, PairingReply};

use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::history::TransportOrigin;
use crate::identity::DeviceId;
use crate::protocol::{PairingMessage, RelayControlMessage, SyncEnvelope};
use crate::{Error, Result};

/// The two transports a peer can be reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Lan,
    Cloud,
}

impl From<TransportKind> for TransportOrigin {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Lan => TransportOrigin::Lan,
            TransportKind::Cloud => TransportOrigin::Cloud,
        }
    }
}

/// Traffic arriving from any transport, routed by the service
#[derive(Debug)]
pub enum InboundEvent {
    /// A sync envelope pulled out of a binary frame
    Envelope {
        envelope: SyncEnvelope,
        transport: TransportKind,
    },
    /// A raw-JSON pairing frame; `reply` writes back on the same socket
    /// when the frame arrived over the LAN server
    PairingFrame {
        message: PairingMessage,
        reply: Option<PairingReply>,
    },
    /// Relay control traffic, consumed locally
    RelayControl(RelayControlMessage),
}

/// Classify one decoded frame into an inbound event.
///
/// Pairing frames are raw JSON with a top-level `challenge_id`; relay
/// control messages carry `msg_type == "control"`; everything else must
/// parse as a sync envelope.
pub fn classify_frame(
    bytes: &[u8],
    transport: TransportKind,
    reply: Option<PairingReply>,
) -> Result<InboundEvent> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::PayloadMalformed(format!("frame is not JSON: {}", e)))?;

    if PairingMessage::is_pairing_frame(&value) {
        let message = PairingMessage::from_value(value)?;
        return Ok(InboundEvent::PairingFrame { message, reply });
    }

    if RelayControlMessage::is_control(&value) {
        let control: RelayControlMessage = serde_json::from_value(value)?;
        return Ok(InboundEvent::RelayControl(control));
    }

    let envelope: SyncEnvelope = serde_json::from_value(value)?;
    Ok(InboundEvent::Envelope {
        envelope,
        transport,
    })
}

/// Build a WebSocket client request carrying the handshake headers both
/// the LAN server and the relay require
pub fn client_request(url: &url::Url, device_id: &DeviceId) -> Result<Request> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Network(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        "X-Device-Id",
        HeaderValue::from_str(device_id.as_str())
            .map_err(|e| Error::Network(e.to_string()))?,
    );
    headers.insert(
        "X-Device-Platform",
        HeaderValue::from_static(crate::protocol::constants::local_platform()),
    );

    Ok(request)
}
