//! High-level Hypo service that wires the sync fabric together
//!
//! Owns the subsystem handles and the routing tasks between them:
//! observer events into the coordinator, inbound transport frames through
//! the engine, pairing frames to the pairing manager, and everything
//! user-visible out through one [`ServiceEvent`] stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clipboard::{start_observer, ClipboardObserver, ObserverEvent, Pasteboard};
use crate::coordinator::{
    CoordinatorEvent, CoordinatorNotice, EventSource, SendOutcome, SyncCoordinator,
};
use crate::discovery::{DiscoveredPeer, DiscoveryEvent, DiscoveryService, TxtAttributes};
use crate::engine::SyncEngine;
use crate::history::{ClipboardItem, HistoryStore, TransportOrigin};
use crate::identity::{DeviceId, DeviceIdentity, KeyStore, MasterKey};
use crate::pairing::{CodeGrant, PairingEvent, PairingManager, RelayPairingApi, TrustStore};
use crate::protocol::PairingPayload;
use crate::transport::{
    InboundEvent, LanServer, PairingReply, RelayClient, RelayConfig, TransportManager,
};
use crate::protocol::PairingMessage;
use crate::{Config, Error, Result};

/// Events emitted by the service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A device appeared on the local network
    DeviceDiscovered(DiscoveredPeer),
    /// A device's advertisement went away
    DeviceLost(String),
    /// A pairing handshake finished
    PairingCompleted {
        device_id: DeviceId,
        device_name: String,
    },
    PairingFailed {
        reason: String,
    },
    /// A local copy was recorded in history
    ClipboardStored {
        item: ClipboardItem,
    },
    /// A peer's clipboard arrived and became the local pasteboard
    ClipboardReceived {
        from_device: DeviceId,
        from_name: String,
        transport: TransportOrigin,
        preview: String,
    },
    /// Fan-out finished for a local copy
    ClipboardSent {
        item_id: Uuid,
        delivered: usize,
        failed: usize,
    },
    /// An inbound envelope could not be opened; names the sender so the
    /// embedding UI can surface a warning
    InboundRejected {
        sender: DeviceId,
        reason: String,
    },
    /// The platform denied clipboard reads (app not focused)
    ClipboardAccessDenied,
    /// Local content exceeded a size cap
    ClipboardTooLarge {
        size: usize,
        max: usize,
    },
    Error(String),
}

/// The assembled sync fabric for one device
pub struct HypoService {
    config: Config,
    identity: DeviceIdentity,
    key_store: Arc<KeyStore>,
    history: Arc<dyn HistoryStore>,
    pasteboard: Arc<dyn Pasteboard>,
    discovery: Option<Arc<DiscoveryService>>,
    transport: Option<Arc<TransportManager>>,
    pairing: Option<Arc<PairingManager>>,
    coordinator: Option<SyncCoordinator>,
    observer: Option<Arc<ClipboardObserver>>,
    lan_port: u16,
}

impl HypoService {
    /// Create the service with the OS keyring guarding the key store
    pub fn new(
        config: Config,
        pasteboard: Arc<dyn Pasteboard>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        let master = MasterKey::from_os_keyring()?;
        Self::with_master_key(config, pasteboard, history, master)
    }

    /// Create the service with an explicit master key (tests, platforms
    /// without a keyring)
    pub fn with_master_key(
        config: Config,
        pasteboard: Arc<dyn Pasteboard>,
        history: Arc<dyn HistoryStore>,
        master: MasterKey,
    ) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(
            &config.data_dir.join("identity.json"),
            config.device_name.clone(),
        )?;
        let key_store = KeyStore::open(config.data_dir.join("keystore.enc"), master)?;

        tracing::info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            "hypo service created"
        );

        Ok(Self {
            lan_port: config.port,
            config,
            identity,
            key_store,
            history,
            pasteboard,
            discovery: None,
            transport: None,
            pairing: None,
            coordinator: None,
            observer: None,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.identity.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.identity.device_name
    }

    /// Hex SHA-256 of the LAN public key, as advertised in TXT
    pub async fn fingerprint(&self) -> String {
        self.key_store
            .static_secret()
            .await
            .public_key()
            .fingerprint_sha256()
    }

    /// Start every subsystem and return the event stream
    pub async fn start(&mut self) -> Result<mpsc::Receiver<ServiceEvent>> {
        let (events_tx, events_rx) = mpsc::channel(64);

        // Inbound funnel shared by the LAN server, LAN clients, and relay
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(64);

        // LAN server first: its bound port goes into the advertisement
        let server = LanServer::bind(self.config.port).await?;
        self.lan_port = server.port();
        let _server_handle = server.start(inbound_tx.clone());

        // Discovery: advertise identity TXT attributes and browse
        let static_public = self.key_store.static_secret().await.public_key();
        let signing_public = self.key_store.signing_key().await.verifying_key();
        let discovery = Arc::new(DiscoveryService::new(self.identity.device_id.clone())?);
        discovery
            .register(
                &self.identity.device_name,
                self.lan_port,
                TxtAttributes {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    fingerprint_sha256: static_public.fingerprint_sha256(),
                    device_id: self.identity.device_id.clone(),
                    pub_key: static_public.to_base64(),
                    signing_pub_key: signing_public.to_base64(),
                },
            )
            .await?;
        let mut discovery_rx = discovery.browse().await?;
        self.discovery = Some(discovery.clone());

        // Relay client, when configured
        let relay = self.config.relay_url.clone().map(|url| {
            RelayClient::start(
                RelayConfig {
                    url,
                    pinned_fingerprint: self.config.relay_fingerprint_sha256.clone(),
                },
                self.identity.device_id.clone(),
                inbound_tx.clone(),
            )
        });

        // Transport manager over discovery + relay
        let transport = TransportManager::new(
            self.identity.device_id.clone(),
            discovery.clone(),
            relay,
            inbound_tx.clone(),
            self.config.data_dir.join("peers.json"),
            self.config.stale_peer_timeout,
        );
        transport.spawn_maintenance();
        self.transport = Some(transport.clone());

        // Engine
        let engine = Arc::new(SyncEngine::new(
            self.identity.device_id.clone(),
            self.identity.device_name.clone(),
            self.key_store.clone(),
            transport.clone(),
            self.config.allow_plaintext_sync,
        ));

        // Observer over the platform pasteboard
        let (mut observer_rx, observer) = start_observer(
            self.pasteboard.clone(),
            self.config.clipboard_poll_interval,
        );
        let observer = Arc::new(observer);
        self.observer = Some(observer.clone());

        // Coordinator actor
        let (notices_tx, mut notices_rx) = mpsc::channel(64);
        let coordinator = SyncCoordinator::start(
            self.identity.device_id.clone(),
            self.identity.device_name.clone(),
            self.history.clone(),
            engine.clone(),
            self.key_store.clone(),
            self.pasteboard.clone(),
            observer,
            notices_tx,
        );
        let coordinator_tx = coordinator.sender();
        self.coordinator = Some(coordinator);

        // Pairing manager
        let (pairing_tx, mut pairing_rx) = mpsc::channel(16);
        let pairing = Arc::new(PairingManager::new(
            self.identity.clone(),
            self.key_store.clone(),
            transport.clone(),
            TrustStore::open(self.config.data_dir.join("trust.json")),
            self.config.relay_api_url.clone().map(RelayPairingApi::new),
            self.lan_port,
            pairing_tx,
        ));
        self.pairing = Some(pairing.clone());

        // Route inbound transport traffic
        let router_engine = engine.clone();
        let router_pairing = pairing.clone();
        let router_coordinator = coordinator_tx.clone();
        let router_events = events_tx.clone();
        tokio::spawn(route_inbound(
            inbound_rx,
            router_engine,
            router_pairing,
            router_coordinator,
            router_events,
        ));

        // Forward discovery events into the registry and event stream
        let discovery_transport = transport.clone();
        let discovery_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = discovery_rx.recv().await {
                match event {
                    DiscoveryEvent::Added(peer) => {
                        discovery_transport.on_discovery_added(&peer).await;
                        if discovery_events
                            .send(ServiceEvent::DeviceDiscovered(peer))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    DiscoveryEvent::Removed(name) => {
                        if discovery_events
                            .send(ServiceEvent::DeviceLost(name))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Forward observer events into the coordinator
        let observer_coordinator = coordinator_tx.clone();
        let observer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = observer_rx.recv().await {
                match event {
                    ObserverEvent::Changed(change) => {
                        let _ = observer_coordinator
                            .send(CoordinatorEvent {
                                content: change.content,
                                source: EventSource::Local,
                            })
                            .await;
                    }
                    ObserverEvent::ReadDenied => {
                        let _ = observer_events
                            .send(ServiceEvent::ClipboardAccessDenied)
                            .await;
                    }
                    ObserverEvent::TooLarge { size, max } => {
                        let _ = observer_events
                            .send(ServiceEvent::ClipboardTooLarge { size, max })
                            .await;
                    }
                }
            }
        });

        // Map coordinator notices onto service events
        let notices_events = events_tx.clone();
        let local_id = self.identity.device_id.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices_rx.recv().await {
                let event = match notice {
                    CoordinatorNotice::Stored { item } => {
                        if item.origin_device_id == local_id {
                            ServiceEvent::ClipboardStored { item }
                        } else {
                            ServiceEvent::ClipboardReceived {
                                from_device: item.origin_device_id.clone(),
                                from_name: item.origin_device_name.clone(),
                                transport: item.transport_origin,
                                preview: item.preview.clone(),
                            }
                        }
                    }
                    CoordinatorNotice::Broadcast { item_id, outcomes } => {
                        let delivered = outcomes
                            .iter()
                            .filter(|(_, o)| matches!(o, SendOutcome::Delivered(_)))
                            .count();
                        ServiceEvent::ClipboardSent {
                            item_id,
                            delivered,
                            failed: outcomes.len() - delivered,
                        }
                    }
                    CoordinatorNotice::NoTargets { item_id } => ServiceEvent::ClipboardSent {
                        item_id,
                        delivered: 0,
                        failed: 0,
                    },
                    CoordinatorNotice::PasteboardWriteFailed { reason } => {
                        ServiceEvent::Error(format!("pasteboard write failed: {}", reason))
                    }
                };
                if notices_events.send(event).await.is_err() {
                    break;
                }
            }
        });

        // Pairing lifecycle events
        let pairing_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = pairing_rx.recv().await {
                let mapped = match event {
                    PairingEvent::Completed {
                        device_id,
                        device_name,
                    } => ServiceEvent::PairingCompleted {
                        device_id,
                        device_name,
                    },
                    PairingEvent::Failed { reason } => ServiceEvent::PairingFailed { reason },
                };
                if pairing_events.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        tracing::info!(port = self.lan_port, "hypo service started");
        Ok(events_rx)
    }

    /// Feed a platform connectivity-change signal into the fabric
    pub async fn notify_network_change(&self) {
        if let Some(transport) = &self.transport {
            transport.on_network_change().await;
        }
    }

    /// Stop the observer and coordinator tasks; sockets close as their
    /// owners are dropped
    pub fn stop(&self) {
        if let Some(observer) = &self.observer {
            observer.abort();
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.abort();
        }
        tracing::info!("hypo service stopped");
    }

    /// Signed pairing payload for QR display
    pub async fn qr_payload(&self) -> Result<PairingPayload> {
        let pairing = self.pairing()?;
        let host = crate::discovery::get_local_ips()
            .first()
            .map(|ip| ip.to_string());
        pairing.qr_payload(host).await
    }

    /// Pair with a scanned QR string
    pub async fn pair_via_qr(&self, qr: &str) -> Result<()> {
        self.pairing()?.pair_via_qr(qr).await
    }

    /// Pair with a LAN-discovered peer by device id
    pub async fn pair_lan_auto(&self, peer_id: &DeviceId) -> Result<()> {
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage("service not started".to_string()))?;
        let peer = discovery
            .get_peer(peer_id)
            .await
            .ok_or_else(|| Error::NotPaired(format!("peer {} not discovered", peer_id)))?;
        if !peer.auto_pairable() {
            return Err(Error::InvalidMessage(
                "peer does not advertise pairing keys".to_string(),
            ));
        }
        self.pairing()?.pair_lan_auto(&peer).await
    }

    /// Redeem a remote 6-digit pairing code
    pub async fn pair_via_code(&self, code: &str) -> Result<()> {
        self.pairing()?.pair_via_code(code).await
    }

    /// Create a remote pairing code for another device to claim
    pub async fn create_remote_code(&self) -> Result<CodeGrant> {
        let pairing = self.pairing()?;
        pairing.create_remote_code().await
    }

    /// Explicitly unpair a device
    pub async fn unpair(&self, peer: &DeviceId) -> Result<()> {
        self.pairing()?.unpair(peer).await
    }

    /// Paired device ids from the key store
    pub async fn paired_devices(&self) -> Vec<DeviceId> {
        self.key_store.list().await
    }

    /// Peers currently visible on the LAN
    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        match &self.discovery {
            Some(discovery) => discovery.get_peers().await,
            None => Vec::new(),
        }
    }

    fn pairing(&self) -> Result<&Arc<PairingManager>> {
        self.pairing
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage("service not started".to_string()))
    }
}

/// Inbound router: envelopes through the engine into the coordinator,
/// pairing frames to the pairing manager, control traffic logged
async fn route_inbound(
    mut inbound_rx: mpsc::Receiver<InboundEvent>,
    engine: Arc<SyncEngine>,
    pairing: Arc<PairingManager>,
    coordinator_tx: mpsc::Sender<CoordinatorEvent>,
    events_tx: mpsc::Sender<ServiceEvent>,
) {
    while let Some(event) = inbound_rx.recv().await {
        match event {
            InboundEvent::Envelope {
                envelope,
                transport,
            } => {
                let sender = envelope.payload.device_id.clone();
                match engine.decode(&envelope).await {
                    Ok(incoming) => {
                        let encrypted = !envelope.payload.encryption.is_plaintext();
                        let _ = coordinator_tx
                            .send(CoordinatorEvent {
                                content: incoming.content,
                                source: EventSource::Remote {
                                    sender: incoming.sender,
                                    sender_name: incoming.sender_name,
                                    transport: transport.into(),
                                    encrypted,
                                },
                            })
                            .await;
                    }
                    Err(e @ (Error::MissingKey(_) | Error::DecryptionFailed(_))) => {
                        tracing::warn!(sender = %sender, "inbound envelope rejected: {}", e);
                        let _ = events_tx
                            .send(ServiceEvent::InboundRejected {
                                sender,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(sender = %sender, "dropping inbound envelope: {}", e);
                    }
                }
            }
            InboundEvent::PairingFrame { message, reply } => {
                handle_pairing_frame(&pairing, message, reply, &events_tx).await;
            }
            InboundEvent::RelayControl(control) => {
                // Already logged by the relay client; nothing to route
                tracing::debug!(event = %control.event, "relay control consumed");
            }
        }
    }
}

async fn handle_pairing_frame(
    pairing: &Arc<PairingManager>,
    message: PairingMessage,
    reply: Option<PairingReply>,
    events_tx: &mpsc::Sender<ServiceEvent>,
) {
    let result = match message {
        PairingMessage::Challenge(challenge) => {
            pairing.handle_challenge(challenge, reply).await
        }
        PairingMessage::Ack(ack) => pairing.handle_ack(ack).await,
    };

    if let Err(e) = result {
        tracing::warn!("pairing frame failed: {}", e);
        let _ = events_tx
            .send(ServiceEvent::PairingFailed {
                reason: e.to_string(),
            })
            .await;
    }
}
