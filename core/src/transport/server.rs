//! Inbound LAN WebSocket server
//!
//! Accepts connections on the fixed LAN port and routes frames: pairing
//! frames (raw JSON with a top-level `challenge_id`) to the pairing
//! manager, sync envelopes to the coordinator path. Each socket gets
//! exactly one reader task that owns its decode buffer; replies go through
//! a writer task so no two tasks ever touch the same half.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::framing::{encode_frame, FrameDecoder};
use crate::identity::DeviceId;
use crate::protocol::constants::OUTBOUND_QUEUE_CAPACITY;
use crate::transport::{classify_frame, InboundEvent, TransportKind};
use crate::{Error, Result};

/// Write half of an inbound socket, handed to the pairing manager so it
/// can answer a challenge on the connection it arrived on
#[derive(Debug, Clone)]
pub struct PairingReply {
    tx: mpsc::Sender<Message>,
}

impl PairingReply {
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let frame = encode_frame(&serde_json::to_vec(value)?)?;
        self.tx
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// LAN WebSocket acceptor
pub struct LanServer {
    listener: TcpListener,
    port: u16,
}

impl LanServer {
    /// Bind the listen socket
    pub async fn bind(port: u16) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind: {}", e)))?;

        let actual_port = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        tracing::info!(port = actual_port, "LAN server listening");

        Ok(Self {
            listener,
            port: actual_port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start accepting connections, routing inbound events to `inbound_tx`
    pub fn start(self, inbound_tx: mpsc::Sender<InboundEvent>) -> LanServerHandle {
        let task = tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, addr)) => {
                        let tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, tx).await {
                                tracing::debug!("connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
        });

        LanServerHandle { task }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inbound_tx: mpsc::Sender<InboundEvent>,
) -> Result<()> {
    let mut remote_device: Option<DeviceId> = None;

    let header_capture = |request: &Request,
                          response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        if let Some(value) = request.headers().get("X-Device-Id") {
            if let Ok(raw) = value.to_str() {
                if let Ok(id) = DeviceId::normalize(raw) {
                    remote_device = Some(id);
                }
            }
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, header_capture)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    tracing::debug!(
        remote = ?remote_device,
        "accepted LAN connection from {}",
        addr
    );

    let (mut sink, mut stream) = ws.split();

    // Writer task: the only owner of the sink
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(message) = writer_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // This task is the sole owner of the receive buffer; parsing and
    // dispatch happen here
    let mut decoder = FrameDecoder::new();

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                let frames = match decoder.push(&data) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!("closing {}: {}", addr, e);
                        break;
                    }
                };

                for frame in frames {
                    let reply = PairingReply {
                        tx: writer_tx.clone(),
                    };
                    match classify_frame(&frame, TransportKind::Lan, Some(reply)) {
                        Ok(event) => {
                            if inbound_tx.send(event).await.is_err() {
                                writer.abort();
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping frame from {}: {}", addr, e);
                        }
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = writer_tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("read error from {}: {}", addr, e);
                break;
            }
        }
    }

    writer.abort();
    Ok(())
}

/// Handle to the running server
pub struct LanServerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl LanServerHandle {
    pub fn abort(self) {
        self.task.abort();
    }
}
