//! Transport manager: peer registry and LAN-first transport selection
//!
//! Owns the per-peer view (discovery plus pairing), the pool of outbound
//! LAN connections, and the relay handle. Sends prefer an open LAN
//! connection, then a bounded LAN dial, then the relay.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::crypto::{PublicKey, VerifyingKey};
use crate::discovery::{DiscoveredPeer, DiscoveryService};
use crate::identity::DeviceId;
use crate::protocol::constants::{LAN_DIAL_TIMEOUT, STALE_PEER_TIMEOUT};
use crate::transport::{InboundEvent, LanConnection, RelayClient, TransportKind};
use crate::{Error, Result};

/// Everything known about one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<VerifyingKey>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_transport: Option<TransportKind>,
    /// Survives unpair-less restarts; only explicit unpair removes it
    #[serde(default)]
    pub paired: bool,
}

impl PeerRecord {
    fn from_discovery(peer: &DiscoveredPeer, device_id: DeviceId) -> Self {
        Self {
            device_id,
            display_name: Some(peer.device_name.clone()),
            host: peer.addresses.first().copied(),
            port: Some(peer.port),
            fingerprint_sha256: peer.fingerprint_sha256.clone(),
            public_key: peer.public_key.clone(),
            signing_public_key: peer.signing_public_key.clone(),
            last_seen: peer.last_seen,
            last_successful_transport: None,
            paired: false,
        }
    }
}

/// Peer registry plus transport selection
pub struct TransportManager {
    local_id: DeviceId,
    peers: RwLock<HashMap<DeviceId, PeerRecord>>,
    lan_connections: Mutex<HashMap<DeviceId, (Arc<LanConnection>, url::Url)>>,
    relay: Option<RelayClient>,
    discovery: Arc<DiscoveryService>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    registry_path: PathBuf,
    stale_timeout: Duration,
}

impl TransportManager {
    pub fn new(
        local_id: DeviceId,
        discovery: Arc<DiscoveryService>,
        relay: Option<RelayClient>,
        inbound_tx: mpsc::Sender<InboundEvent>,
        registry_path: PathBuf,
        stale_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let peers = load_registry(&registry_path);

        Arc::new(Self {
            local_id,
            peers: RwLock::new(peers),
            lan_connections: Mutex::new(HashMap::new()),
            relay,
            discovery,
            inbound_tx,
            registry_path,
            stale_timeout: stale_timeout.unwrap_or(STALE_PEER_TIMEOUT),
        })
    }

    /// Send a framed envelope to a peer, LAN first with cloud fallback
    pub async fn send_frame(&self, peer: &DeviceId, frame: Vec<u8>) -> Result<TransportKind> {
        // 1. An open LAN connection wins outright
        if let Some(kind) = self.try_open_lan(peer, &frame).await? {
            return Ok(kind);
        }

        // 2. Attempt a LAN dial inside the dial budget
        match self.try_dial_lan(peer, &frame).await {
            Ok(Some(kind)) => return Ok(kind),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(peer = %peer, "LAN dial failed: {}", e);
            }
        }

        // 3. Fall back to the relay
        if let Some(relay) = &self.relay {
            tracing::debug!(peer = %peer, "falling back to cloud relay");
            relay.send(frame).await?;
            self.record_success(peer, TransportKind::Cloud).await;
            return Ok(TransportKind::Cloud);
        }

        Err(Error::TransportUnavailable(peer.to_string()))
    }

    async fn try_open_lan(&self, peer: &DeviceId, frame: &[u8]) -> Result<Option<TransportKind>> {
        let conn = {
            let connections = self.lan_connections.lock().await;
            connections.get(peer).map(|(conn, _)| conn.clone())
        };

        if let Some(conn) = conn {
            if conn.is_open() {
                conn.send(frame.to_vec()).await?;
                self.record_success(peer, TransportKind::Lan).await;
                return Ok(Some(TransportKind::Lan));
            }
        }
        Ok(None)
    }

    async fn try_dial_lan(&self, peer: &DeviceId, frame: &[u8]) -> Result<Option<TransportKind>> {
        let Some(url) = self.lan_url(peer).await else {
            return Ok(None);
        };

        // The pool lock covers only bookkeeping; the dial itself runs on a
        // cloned handle so concurrent fan-out sends do not serialize
        let conn = {
            let mut connections = self.lan_connections.lock().await;

            // A cached connection pointing at a stale address is useless;
            // the peer's IP may have changed under the mDNS cache
            if let Some((cached, cached_url)) = connections.get(peer) {
                if *cached_url != url {
                    cached.close();
                    connections.remove(peer);
                }
            }

            if !connections.contains_key(peer) {
                let conn = Arc::new(LanConnection::open(
                    peer.clone(),
                    url.clone(),
                    None,
                    self.local_id.clone(),
                    self.inbound_tx.clone(),
                )?);
                connections.insert(peer.clone(), (conn, url.clone()));
            }

            connections
                .get(peer)
                .map(|(conn, _)| conn.clone())
                .expect("just inserted")
        };

        match conn.wait_open(LAN_DIAL_TIMEOUT).await {
            Ok(()) => {
                conn.send(frame.to_vec()).await?;
                self.record_success(peer, TransportKind::Lan).await;
                Ok(Some(TransportKind::Lan))
            }
            Err(e) => {
                tracing::debug!(peer = %peer, "LAN dial timed out: {}", e);
                Ok(None)
            }
        }
    }

    async fn lan_url(&self, peer: &DeviceId) -> Option<url::Url> {
        // Prefer the live discovery view over the persisted record
        if let Some(discovered) = self.discovery.get_peer(peer).await {
            if let Some(addr) = discovered.addresses.first() {
                return lan_ws_url(*addr, discovered.port);
            }
        }

        let peers = self.peers.read().await;
        let record = peers.get(peer)?;
        lan_ws_url(record.host?, record.port?)
    }

    /// Fold a discovery event into the registry
    pub async fn on_discovery_added(&self, discovered: &DiscoveredPeer) {
        let Some(device_id) = discovered.device_id.clone() else {
            return;
        };
        if device_id == self.local_id {
            return;
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&device_id) {
            Some(record) => {
                record.display_name = Some(discovered.device_name.clone());
                record.host = discovered.addresses.first().copied();
                record.port = Some(discovered.port);
                record.last_seen = discovered.last_seen;
                if discovered.public_key.is_some() {
                    record.public_key = discovered.public_key.clone();
                }
                if discovered.signing_public_key.is_some() {
                    record.signing_public_key = discovered.signing_public_key.clone();
                }
                if discovered.fingerprint_sha256.is_some() {
                    record.fingerprint_sha256 = discovered.fingerprint_sha256.clone();
                }
            }
            None => {
                peers.insert(
                    device_id.clone(),
                    PeerRecord::from_discovery(discovered, device_id),
                );
            }
        }
    }

    /// The interface set changed: refresh discovery, re-announce with
    /// current addresses, reset the relay (NAT state is stale), and drop
    /// LAN connections that now point at dead routes
    pub async fn on_network_change(&self) {
        tracing::info!("network change: refreshing transports");

        if let Err(e) = self.discovery.refresh().await {
            tracing::warn!("discovery refresh failed: {}", e);
        }

        if let Some(relay) = &self.relay {
            relay.trigger_reconnect();
        }

        let mut connections = self.lan_connections.lock().await;
        for (_, (conn, _)) in connections.drain() {
            conn.close();
        }
    }

    /// Record a completed pairing
    pub async fn mark_paired(
        &self,
        device_id: DeviceId,
        display_name: Option<String>,
        public_key: Option<PublicKey>,
        signing_public_key: Option<VerifyingKey>,
    ) {
        let mut peers = self.peers.write().await;
        let record = peers.entry(device_id.clone()).or_insert_with(|| PeerRecord {
            device_id: device_id.clone(),
            display_name: None,
            host: None,
            port: None,
            fingerprint_sha256: None,
            public_key: None,
            signing_public_key: None,
            last_seen: Utc::now(),
            last_successful_transport: None,
            paired: false,
        });
        record.paired = true;
        record.last_seen = Utc::now();
        if display_name.is_some() {
            record.display_name = display_name;
        }
        if public_key.is_some() {
            record.public_key = public_key;
        }
        if signing_public_key.is_some() {
            record.signing_public_key = signing_public_key;
        }

        save_registry(&self.registry_path, &peers);
    }

    /// Explicit unpair: the only operation that destroys a peer record
    pub async fn unpair(&self, device_id: &DeviceId) {
        let mut peers = self.peers.write().await;
        peers.remove(device_id);
        save_registry(&self.registry_path, &peers);
        drop(peers);

        let mut connections = self.lan_connections.lock().await;
        if let Some((conn, _)) = connections.remove(device_id) {
            conn.close();
        }
    }

    async fn record_success(&self, peer: &DeviceId, kind: TransportKind) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(peer) {
            record.last_successful_transport = Some(kind);
            record.last_seen = Utc::now();
        }
    }

    /// Drop unpaired peers that have not been seen within the stale window
    pub async fn prune_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_timeout).expect("timeout fits chrono");

        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, record| record.paired || record.last_seen >= cutoff);
        if peers.len() < before {
            tracing::debug!(removed = before - peers.len(), "pruned stale peers");
        }
        drop(peers);

        self.discovery.prune_stale(cutoff).await;
    }

    /// Spawn the periodic pruning task
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                manager.prune_stale().await;
            }
        })
    }

    pub async fn peer(&self, device_id: &DeviceId) -> Option<PeerRecord> {
        self.peers.read().await.get(device_id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub fn relay(&self) -> Option<&RelayClient> {
        self.relay.as_ref()
    }
}

fn lan_ws_url(addr: IpAddr, port: u16) -> Option<url::Url> {
    let rendered = match addr {
        IpAddr::V4(v4) => format!("ws://{}:{}/sync", v4, port),
        IpAddr::V6(v6) => format!("ws://[{}]:{}/sync", v6, port),
    };
    url::Url::parse(&rendered).ok()
}

fn load_registry(path: &PathBuf) -> HashMap<DeviceId, PeerRecord> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|data| serde_json::from_str::<Vec<PeerRecord>>(&data).map_err(Error::from))
    {
        Ok(records) => records
            .into_iter()
            .map(|r| (r.device_id.clone(), r))
            .collect(),
        Err(e) => {
            tracing::warn!("could not load peer registry: {}", e);
            HashMap::new()
        }
    }
}

fn save_registry(path: &PathBuf, peers: &HashMap<DeviceId, PeerRecord>) {
    // Only paired peers persist; the auto set rebuilds from discovery
    let records: Vec<&PeerRecord> = peers.values().filter(|r| r.paired).collect();

    let write = || -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&records)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    };
    if let Err(e) = write() {
        tracing::warn!("could not save peer registry: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("hypo-reg-{}", uuid::Uuid::new_v4()))
            .join("peers.json")
    }

    fn manager() -> (Arc<TransportManager>, PathBuf) {
        let local = DeviceId::generate();
        let discovery = Arc::new(DiscoveryService::new(local.clone()).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let path = temp_path();
        let mgr = TransportManager::new(local, discovery, None, tx, path.clone(), None);
        (mgr, path)
    }

    fn discovered(id: &DeviceId) -> DiscoveredPeer {
        DiscoveredPeer {
            service_name: "peer".to_string(),
            device_id: Some(id.clone()),
            device_name: "peer".to_string(),
            addresses: vec!["10.0.0.137".parse().unwrap()],
            port: 7010,
            version: Some("0.1.0".to_string()),
            fingerprint_sha256: None,
            public_key: None,
            signing_public_key: None,
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_discovery_populates_registry() {
        let (mgr, path) = manager();
        let peer = DeviceId::generate();
        mgr.on_discovery_added(&discovered(&peer)).await;

        let record = mgr.peer(&peer).await.unwrap();
        assert_eq!(record.host, Some("10.0.0.137".parse().unwrap()));
        assert!(!record.paired);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_discovery_updates_changed_ip() {
        let (mgr, path) = manager();
        let peer = DeviceId::generate();
        mgr.on_discovery_added(&discovered(&peer)).await;

        let mut moved = discovered(&peer);
        moved.addresses = vec!["10.0.0.146".parse().unwrap()];
        mgr.on_discovery_added(&moved).await;

        let record = mgr.peer(&peer).await.unwrap();
        assert_eq!(record.host, Some("10.0.0.146".parse().unwrap()));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_paired_peers_survive_pruning() {
        let (mgr, path) = manager();
        let paired = DeviceId::generate();
        let auto = DeviceId::generate();

        mgr.mark_paired(paired.clone(), Some("paired".into()), None, None)
            .await;
        let mut stale = discovered(&auto);
        stale.last_seen = Utc::now() - chrono::Duration::minutes(10);
        mgr.on_discovery_added(&stale).await;

        mgr.prune_stale().await;

        assert!(mgr.peer(&paired).await.is_some());
        assert!(mgr.peer(&auto).await.is_none());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_registry_persists_paired_only() {
        let (mgr, path) = manager();
        let paired = DeviceId::generate();
        let auto = DeviceId::generate();

        mgr.mark_paired(paired.clone(), None, None, None).await;
        mgr.on_discovery_added(&discovered(&auto)).await;
        // Persist runs on pairing mutations; force one more
        mgr.mark_paired(paired.clone(), Some("name".into()), None, None)
            .await;

        let reloaded = load_registry(&path);
        assert!(reloaded.contains_key(&paired));
        assert!(!reloaded.contains_key(&auto));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_unpair_removes_record() {
        let (mgr, path) = manager();
        let peer = DeviceId::generate();
        mgr.mark_paired(peer.clone(), None, None, None).await;
        mgr.unpair(&peer).await;
        assert!(mgr.peer(&peer).await.is_none());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn test_send_without_route_is_unavailable() {
        let (mgr, path) = manager();
        let peer = DeviceId::generate();

        let result = mgr.send_frame(&peer, vec![1, 2, 3]).await;
        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_lan_ws_url_renders_v6() {
        let url = lan_ws_url("fe80::1".parse().unwrap(), 7010).unwrap();
        assert_eq!(url.as_str(), "ws://[fe80::1]:7010/sync");
    }
}
