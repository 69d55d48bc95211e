//! Outbound LAN WebSocket client
//!
//! One connection per peer. Envelopes are enqueued into a bounded channel
//! and drained by a worker task only after the per-connection handshake
//! signal lands; draining earlier hits servers that kill sockets written
//! before the upgrade completes. The queue outlives reconnects.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};

use crate::framing::FrameDecoder;
use crate::identity::DeviceId;
use crate::protocol::constants::{
    HANDSHAKE_SIGNAL_TIMEOUT, LAN_CONNECT_TIMEOUT, LAN_PING_INTERVAL, OUTBOUND_QUEUE_CAPACITY,
    PAIRING_ACK_TIMEOUT,
};
use crate::transport::{classify_frame, client_request, tls, InboundEvent, TransportKind};
use crate::{Error, Result};

/// Connection lifecycle, observable through [`LanConnection::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanState {
    Idle,
    Connecting,
    HandshakePending,
    Open,
    Closing,
}

/// Reconnect backoff bounds for the worker loop
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Handle to one peer's outbound connection
pub struct LanConnection {
    peer_id: DeviceId,
    queue_tx: mpsc::Sender<Vec<u8>>,
    state_rx: watch::Receiver<LanState>,
    task: tokio::task::JoinHandle<()>,
}

impl LanConnection {
    /// Start a connection worker for `url`.
    ///
    /// `wss://` URLs require a pinned certificate fingerprint; plain
    /// `ws://` is allowed on the LAN where trust is anchored in the
    /// Bonjour-advertised public key.
    pub fn open(
        peer_id: DeviceId,
        url: url::Url,
        pinned_fingerprint: Option<String>,
        local_id: DeviceId,
        inbound_tx: mpsc::Sender<InboundEvent>,
    ) -> Result<Self> {
        if url.scheme() == "wss" && pinned_fingerprint.is_none() {
            return Err(Error::Network(
                "wss LAN url requires a pinned fingerprint".to_string(),
            ));
        }

        let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LanState::Idle);

        let worker = ConnectionWorker {
            peer_id: peer_id.clone(),
            url,
            pinned_fingerprint,
            local_id,
            state_tx,
            inbound_tx,
        };
        let task = tokio::spawn(worker.run(queue_rx));

        Ok(Self {
            peer_id,
            queue_tx,
            state_rx,
            task,
        })
    }

    pub fn peer_id(&self) -> &DeviceId {
        &self.peer_id
    }

    /// Enqueue a frame; blocks when the queue is full (backpressure)
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.queue_tx
            .send(frame)
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub fn is_open(&self) -> bool {
        *self.state_rx.borrow() == LanState::Open
    }

    pub fn state(&self) -> LanState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reports `Open`, bounded by `timeout`
    pub async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow_and_update() == LanState::Open {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Cancelled),
            Err(_) => Err(Error::TransportUnavailable(self.peer_id.to_string())),
        }
    }

    /// Tear the connection down and release the socket
    pub fn close(&self) {
        self.task.abort();
    }
}

struct ConnectionWorker {
    peer_id: DeviceId,
    url: url::Url,
    pinned_fingerprint: Option<String>,
    local_id: DeviceId,
    state_tx: watch::Sender<LanState>,
    inbound_tx: mpsc::Sender<InboundEvent>,
}

impl ConnectionWorker {
    async fn run(self, mut queue_rx: mpsc::Receiver<Vec<u8>>) {
        let mut backoff = RECONNECT_BACKOFF_START;
        // A frame that failed mid-send is retried on the next connection
        let mut pending: Option<Vec<u8>> = None;

        loop {
            let _ = self.state_tx.send(LanState::Connecting);

            // The handshake signal is per-connection; a completed signal
            // from a previous attempt must never gate a new socket
            let (handshake_tx, handshake_rx) = oneshot::channel::<()>();

            let ws = match self.connect(handshake_tx).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(peer = %self.peer_id, "LAN connect failed: {}", e);
                    let _ = self.state_tx.send(LanState::Idle);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    continue;
                }
            };

            let _ = self.state_tx.send(LanState::HandshakePending);
            match tokio::time::timeout(HANDSHAKE_SIGNAL_TIMEOUT, handshake_rx).await {
                Ok(Ok(())) => {}
                _ => {
                    tracing::warn!(peer = %self.peer_id, "handshake signal never arrived");
                    let _ = self.state_tx.send(LanState::Idle);
                    continue;
                }
            }

            let _ = self.state_tx.send(LanState::Open);
            backoff = RECONNECT_BACKOFF_START;
            tracing::info!(peer = %self.peer_id, url = %self.url, "LAN connection open");

            let (mut sink, mut stream) = ws.split();

            // Exactly one reader task owns this socket's buffer
            let reader_inbound = self.inbound_tx.clone();
            let reader_peer = self.peer_id.clone();
            let mut reader = tokio::spawn(async move {
                let mut decoder = FrameDecoder::new();
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Binary(data)) => {
                            let frames = match decoder.push(&data) {
                                Ok(frames) => frames,
                                Err(e) => {
                                    tracing::warn!(peer = %reader_peer, "bad frame: {}", e);
                                    return;
                                }
                            };
                            for frame in frames {
                                match classify_frame(&frame, TransportKind::Lan, None) {
                                    Ok(event) => {
                                        if reader_inbound.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(peer = %reader_peer, "dropping frame: {}", e)
                                    }
                                }
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });

            let mut ping = tokio::time::interval_at(
                tokio::time::Instant::now() + LAN_PING_INTERVAL,
                LAN_PING_INTERVAL,
            );

            // Drain loop: only entered after the handshake signal
            let mut handle_dropped = false;
            'drain: loop {
                if let Some(frame) = pending.take() {
                    if let Err(e) = sink.send(Message::Binary(frame.clone().into())).await {
                        tracing::warn!(peer = %self.peer_id, "send failed: {}", e);
                        pending = Some(frame);
                        break 'drain;
                    }
                }

                tokio::select! {
                    maybe = queue_rx.recv() => match maybe {
                        Some(frame) => {
                            if let Err(e) = sink.send(Message::Binary(frame.clone().into())).await {
                                tracing::warn!(peer = %self.peer_id, "send failed: {}", e);
                                pending = Some(frame);
                                break 'drain;
                            }
                        }
                        None => {
                            // Handle dropped: close cleanly and stop
                            let _ = self.state_tx.send(LanState::Closing);
                            let _ = sink.send(Message::Close(None)).await;
                            handle_dropped = true;
                            break 'drain;
                        }
                    },
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break 'drain;
                        }
                    }
                    _ = &mut reader => {
                        tracing::debug!(peer = %self.peer_id, "LAN socket closed by peer");
                        break 'drain;
                    }
                }
            }

            reader.abort();
            let _ = self.state_tx.send(LanState::Idle);
            if handle_dropped {
                return;
            }
        }
    }

    async fn connect(
        &self,
        handshake_tx: oneshot::Sender<()>,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let request = client_request(&self.url, &self.local_id)?;
        let connector = self.connector()?;

        let connected = tokio::time::timeout(
            LAN_CONNECT_TIMEOUT,
            connect_async_tls_with_config(request, None, false, Some(connector)),
        )
        .await
        .map_err(|_| Error::Network("LAN connect timed out".to_string()))?
        .map_err(|e| Error::Network(e.to_string()))?;

        // The WebSocket upgrade completed: this is the open event
        let _ = handshake_tx.send(());
        Ok(connected.0)
    }

    fn connector(&self) -> Result<Connector> {
        match (self.url.scheme(), &self.pinned_fingerprint) {
            ("wss", Some(pin)) => tls::pinned_connector(pin),
            _ => Ok(Connector::Plain),
        }
    }
}

/// One-shot pairing round-trip over a dedicated LAN socket: send a framed
/// pairing message, await the first framed reply.
pub async fn pair_exchange(
    url: url::Url,
    pinned_fingerprint: Option<String>,
    local_id: DeviceId,
    request_frame: Vec<u8>,
) -> Result<Vec<u8>> {
    let request = client_request(&url, &local_id)?;
    let connector = match (url.scheme(), &pinned_fingerprint) {
        ("wss", Some(pin)) => tls::pinned_connector(pin)?,
        _ => Connector::Plain,
    };

    let (ws, _) = tokio::time::timeout(
        LAN_CONNECT_TIMEOUT,
        connect_async_tls_with_config(request, None, false, Some(connector)),
    )
    .await
    .map_err(|_| Error::Network("pairing connect timed out".to_string()))?
    .map_err(|e| Error::Network(e.to_string()))?;

    let (mut sink, mut stream) = ws.split();
    sink.send(Message::Binary(request_frame.into()))
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    let reply = tokio::time::timeout(PAIRING_ACK_TIMEOUT, async {
        let mut decoder = FrameDecoder::new();
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if let Some(frame) = decoder.push(&data)?.into_iter().next() {
                        return Ok(frame);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::Network(e.to_string())),
            }
        }
        Err(Error::Network(
            "connection closed before pairing reply".to_string(),
        ))
    })
    .await
    .map_err(|_| Error::HandshakeTimeout("no pairing reply".to_string()))??;

    let _ = sink.send(Message::Close(None)).await;
    Ok(reply)
}
