//! Cloud relay WebSocket client
//!
//! One long-lived TLS connection to the relay. Closures and handshake
//! failures reconnect with truncated exponential backoff; an application
//! ping every 20 s keeps NAT bindings warm and detects dead sockets.
//! Outbound frames carry a retry budget; control messages from the relay
//! are consumed here and never surface as sync traffic.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async_tls_with_config;

use crate::framing::FrameDecoder;
use crate::identity::DeviceId;
use crate::protocol::constants::{
    CLOUD_CONNECT_TIMEOUT, MAX_FRAME_SIZE, OUTBOUND_QUEUE_CAPACITY, RELAY_BACKOFF_CAP,
    RELAY_PING_INTERVAL, SEND_RETRY_ATTEMPTS, SEND_RETRY_BUDGET,
};
use crate::transport::{classify_frame, client_request, tls, InboundEvent, TransportKind};
use crate::{Error, Result};

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `wss://` URL; query parameters are preserved on the handshake
    pub url: url::Url,
    /// Hex SHA-256 of the relay certificate; required for `wss://`
    pub pinned_fingerprint: Option<String>,
}

/// An outbound frame with its retry bookkeeping
struct QueuedFrame {
    frame: Vec<u8>,
    attempts: u32,
    enqueued_at: Instant,
}

/// Handle to the relay client task
pub struct RelayClient {
    queue_tx: mpsc::Sender<QueuedFrame>,
    connected_rx: watch::Receiver<bool>,
    reconnect: std::sync::Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Start the relay client task
    pub fn start(
        config: RelayConfig,
        local_id: DeviceId,
        inbound_tx: mpsc::Sender<InboundEvent>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let reconnect = std::sync::Arc::new(Notify::new());

        let worker = RelayWorker {
            config,
            local_id,
            connected_tx,
            inbound_tx,
            reconnect: reconnect.clone(),
        };
        let task = tokio::spawn(worker.run(queue_rx));

        Self {
            queue_tx,
            connected_rx,
            reconnect,
            task,
        }
    }

    /// Enqueue a frame for the relay. Oversized frames are rejected here
    /// with no retry.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::PayloadTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.queue_tx
            .send(QueuedFrame {
                frame,
                attempts: 0,
                enqueued_at: Instant::now(),
            })
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Force a reconnect (e.g. the local IP changed and NAT state is stale)
    pub fn trigger_reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

struct RelayWorker {
    config: RelayConfig,
    local_id: DeviceId,
    connected_tx: watch::Sender<bool>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    reconnect: std::sync::Arc<Notify>,
}

impl RelayWorker {
    async fn run(self, mut queue_rx: mpsc::Receiver<QueuedFrame>) {
        // The single reconnection guard: this task is the only place a
        // relay connection is ever (re)established
        let mut backoff = Duration::from_secs(1);
        let mut pending: Option<QueuedFrame> = None;

        loop {
            let ws = match self.connect().await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::warn!("relay connect failed: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RELAY_BACKOFF_CAP);
                    continue;
                }
            };

            // Successful handshake resets the backoff schedule
            backoff = Duration::from_secs(1);
            let _ = self.connected_tx.send(true);
            tracing::info!(url = %self.config.url, "relay connection open");

            let (mut sink, mut stream) = ws.split();
            let mut decoder = FrameDecoder::new();
            let mut ping = tokio::time::interval_at(
                Instant::now() + RELAY_PING_INTERVAL,
                RELAY_PING_INTERVAL,
            );
            let mut awaiting_pong = false;

            'session: loop {
                // Retry the frame that was in flight when the last
                // connection dropped
                if let Some(queued) = pending.take() {
                    match self.try_send(&mut sink, queued).await {
                        SendOutcome::Sent => {}
                        SendOutcome::Retry(queued) => {
                            pending = Some(queued);
                            break 'session;
                        }
                        SendOutcome::Dropped => {}
                    }
                }

                tokio::select! {
                    maybe = queue_rx.recv() => match maybe {
                        Some(queued) => match self.try_send(&mut sink, queued).await {
                            SendOutcome::Sent => {}
                            SendOutcome::Retry(queued) => {
                                pending = Some(queued);
                                break 'session;
                            }
                            SendOutcome::Dropped => {}
                        },
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = self.connected_tx.send(false);
                            return;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Binary(data))) => {
                            let frames = match decoder.push(&data) {
                                Ok(frames) => frames,
                                Err(e) => {
                                    tracing::warn!("relay framing error: {}", e);
                                    break 'session;
                                }
                            };
                            for frame in frames {
                                self.dispatch(&frame).await;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(text.as_bytes()).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break 'session;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!("relay closed the connection");
                            break 'session;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("relay read error: {}", e);
                            break 'session;
                        }
                    },
                    _ = ping.tick() => {
                        if awaiting_pong {
                            // Previous ping went unanswered: the socket is dead
                            tracing::warn!("relay pong missed, reconnecting");
                            break 'session;
                        }
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break 'session;
                        }
                        awaiting_pong = true;
                    }
                    _ = self.reconnect.notified() => {
                        tracing::info!("relay reconnect requested");
                        break 'session;
                    }
                }
            }

            let _ = self.connected_tx.send(false);
        }
    }

    async fn connect(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let request = client_request(&self.config.url, &self.local_id)?;

        let connector = match (self.config.url.scheme(), &self.config.pinned_fingerprint) {
            ("wss", Some(pin)) => Some(tls::pinned_connector(pin)?),
            _ => None,
        };

        let connected = tokio::time::timeout(
            CLOUD_CONNECT_TIMEOUT,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| Error::Network("relay connect timed out".to_string()))?
        .map_err(|e| Error::Network(e.to_string()))?;

        Ok(connected.0)
    }

    async fn try_send<S>(&self, sink: &mut S, mut queued: QueuedFrame) -> SendOutcome
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        if queued.enqueued_at.elapsed() > SEND_RETRY_BUDGET {
            tracing::warn!("dropping relay frame: retry budget exhausted");
            return SendOutcome::Dropped;
        }

        match sink.send(Message::Binary(queued.frame.clone().into())).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                // A closure mid-transmission is transient and does not
                // consume a retry attempt; other failures do
                if !is_transient(&e.to_string()) {
                    queued.attempts += 1;
                }
                if queued.attempts >= SEND_RETRY_ATTEMPTS {
                    tracing::warn!("dropping relay frame after {} attempts", queued.attempts);
                    SendOutcome::Dropped
                } else {
                    tracing::debug!("relay send failed ({}), will retry", e);
                    SendOutcome::Retry(queued)
                }
            }
        }
    }

    async fn dispatch(&self, bytes: &[u8]) {
        match classify_frame(bytes, TransportKind::Cloud, None) {
            Ok(InboundEvent::RelayControl(control)) => {
                // Informational only; routing failures do not imply the
                // peer never saw the message
                tracing::warn!(
                    event = %control.event,
                    detail = control.detail.as_deref().unwrap_or(""),
                    "relay control message"
                );
                let _ = self
                    .inbound_tx
                    .send(InboundEvent::RelayControl(control))
                    .await;
            }
            Ok(event) => {
                let _ = self.inbound_tx.send(event).await;
            }
            Err(e) => {
                tracing::warn!("dropping relay frame: {}", e);
            }
        }
    }
}

enum SendOutcome {
    Sent,
    Retry(QueuedFrame),
    Dropped,
}

fn is_transient(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("connection closed")
        || lower.contains("already closed")
        || lower.contains("reset")
        || lower.contains("broken pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_frame_rejected_without_retry() {
        let (tx, _rx) = mpsc::channel(1);
        let client = RelayClient::start(
            RelayConfig {
                url: url::Url::parse("wss://relay.invalid/ws").unwrap(),
                pinned_fingerprint: Some(hex::encode([0u8; 32])),
            },
            DeviceId::generate(),
            tx,
        );

        let result = client.send(vec![0u8; MAX_FRAME_SIZE + 1]).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
        client.shutdown();
    }

    #[tokio::test]
    async fn test_queue_survives_while_disconnected() {
        let (tx, _rx) = mpsc::channel(1);
        let client = RelayClient::start(
            RelayConfig {
                url: url::Url::parse("ws://192.0.2.1:9/ws").unwrap(),
                pinned_fingerprint: None,
            },
            DeviceId::generate(),
            tx,
        );

        assert!(!client.is_connected());
        client.send(vec![1, 2, 3]).await.unwrap();
        client.shutdown();
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("Connection closed normally"));
        assert!(is_transient("broken pipe"));
        assert!(!is_transient("capacity exhausted"));
    }
}
