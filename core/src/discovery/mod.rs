//! mDNS service discovery for finding peers on the local network
//!
//! Advertises `_hypo._tcp.` with the identity TXT attributes and browses
//! for other devices. Peers are deduplicated by `device_id` when the TXT
//! record carries one, otherwise by normalized instance name; the local
//! device is filtered out. mDNS caches go stale when interfaces change, so
//! the transport manager calls [`DiscoveryService::refresh`] on
//! network-change signals.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, RwLock};

use crate::crypto::{PublicKey, VerifyingKey};
use crate::identity::DeviceId;
use crate::protocol::constants::{ADVERTISED_PROTOCOLS, SERVICE_TYPE};
use crate::{Error, Result};

/// TXT attributes published with the service advertisement
#[derive(Debug, Clone)]
pub struct TxtAttributes {
    pub version: String,
    pub fingerprint_sha256: String,
    pub device_id: DeviceId,
    pub pub_key: String,
    pub signing_pub_key: String,
}

impl TxtAttributes {
    fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert("version".to_string(), self.version.clone());
        props.insert("protocols".to_string(), ADVERTISED_PROTOCOLS.to_string());
        props.insert(
            "fingerprint_sha256".to_string(),
            self.fingerprint_sha256.clone(),
        );
        props.insert("device_id".to_string(), self.device_id.to_string());
        props.insert("pub_key".to_string(), self.pub_key.clone());
        props.insert("signing_pub_key".to_string(), self.signing_pub_key.clone());
        props
    }
}

/// A peer seen on the local network
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Normalized instance name, the dedup key when TXT lacks a device_id
    pub service_name: String,
    pub device_id: Option<DeviceId>,
    pub device_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub version: Option<String>,
    pub fingerprint_sha256: Option<String>,
    pub public_key: Option<PublicKey>,
    pub signing_public_key: Option<VerifyingKey>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    /// Eligible for LAN auto-discovery pairing: must advertise both an id
    /// and a public key to anchor trust
    pub fn auto_pairable(&self) -> bool {
        self.device_id.is_some() && self.public_key.is_some()
    }
}

/// Event from the discovery browser
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(DiscoveredPeer),
    Removed(String),
}

/// mDNS advertise + browse service
pub struct DiscoveryService {
    daemon: ServiceDaemon,
    local_id: DeviceId,
    peers: Arc<RwLock<HashMap<String, DiscoveredPeer>>>,
    registered: RwLock<Option<(String, u16, TxtAttributes)>>,
    event_tx: RwLock<Option<mpsc::Sender<DiscoveryEvent>>>,
}

impl DiscoveryService {
    pub fn new(local_id: DeviceId) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;

        Ok(Self {
            daemon,
            local_id,
            peers: Arc::new(RwLock::new(HashMap::new())),
            registered: RwLock::new(None),
            event_tx: RwLock::new(None),
        })
    }

    /// Register our advertisement for others to discover
    pub async fn register(&self, device_name: &str, port: u16, txt: TxtAttributes) -> Result<()> {
        let instance_name = format!(
            "{}-{}",
            device_name,
            &self.local_id.as_str()[..8]
        );

        let host = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "hypo".to_string())
        );

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &host,
            (),
            port,
            txt.to_properties(),
        )
        .map_err(|e| Error::Discovery(e.to_string()))?
        .enable_addr_auto();

        self.daemon
            .register(service)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        *self.registered.write().await = Some((device_name.to_string(), port, txt));
        tracing::info!(instance = %instance_name, port, "registered mDNS service");
        Ok(())
    }

    /// Start browsing for peers; returns the event channel
    pub async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(32);
        *self.event_tx.write().await = Some(tx.clone());
        self.spawn_browse_task(tx)?;
        Ok(rx)
    }

    fn spawn_browse_task(&self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let peers = self.peers.clone();
        let local_id = self.local_id.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(peer) = parse_resolved(&info) else {
                            continue;
                        };

                        // Never discover ourselves
                        if peer.device_id.as_ref() == Some(&local_id) {
                            continue;
                        }

                        let key = dedup_key(&peer);
                        peers.write().await.insert(key, peer.clone());

                        if tx.send(DiscoveryEvent::Added(peer)).await.is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let name = normalize_service_name(&fullname);
                        let mut guard = peers.write().await;
                        let removed_key = guard
                            .iter()
                            .find(|(_, p)| p.service_name == name)
                            .map(|(k, _)| k.clone());

                        if let Some(key) = removed_key {
                            guard.remove(&key);
                            drop(guard);
                            if tx.send(DiscoveryEvent::Removed(name)).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    /// Restart browsing and re-register the advertisement.
    ///
    /// Called on network-change signals: the interface set (and therefore
    /// the advertised addresses and the validity of cached responses) has
    /// changed under us.
    pub async fn refresh(&self) -> Result<()> {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            tracing::debug!("stop_browse: {}", e);
        }

        // Clone out of the locks before re-registering; register() takes
        // the same write lock
        let registered = self.registered.read().await.clone();
        if let Some((name, port, txt)) = registered {
            self.register(&name, port, txt).await?;
        }

        let event_tx = self.event_tx.read().await.clone();
        if let Some(tx) = event_tx {
            self.spawn_browse_task(tx)?;
        }

        tracing::info!("discovery refreshed after network change");
        Ok(())
    }

    /// Currently known peers
    pub async fn get_peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Look up a peer by device id
    pub async fn get_peer(&self, id: &DeviceId) -> Option<DiscoveredPeer> {
        self.peers
            .read()
            .await
            .values()
            .find(|p| p.device_id.as_ref() == Some(id))
            .cloned()
    }

    /// Drop peers unseen since `cutoff`; returns the removed dedup keys
    pub async fn prune_stale(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut guard = self.peers.write().await;
        let stale: Vec<String> = guard
            .iter()
            .filter(|(_, p)| p.last_seen < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            guard.remove(key);
        }
        stale
    }

    pub fn shutdown(self) -> Result<()> {
        self.daemon
            .shutdown()
            .map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(())
    }
}

fn parse_resolved(info: &ServiceInfo) -> Option<DiscoveredPeer> {
    let props = info.get_properties();
    let txt = |key: &str| props.get(key).map(|v| v.val_str().to_string());

    let device_id = txt("device_id").and_then(|raw| match DeviceId::normalize(&raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(raw, "peer advertised malformed device_id");
            None
        }
    });

    let public_key = txt("pub_key").and_then(|b64| PublicKey::from_base64(&b64).ok());
    let signing_public_key =
        txt("signing_pub_key").and_then(|b64| VerifyingKey::from_base64(&b64).ok());

    let service_name = normalize_service_name(info.get_fullname());

    Some(DiscoveredPeer {
        device_name: service_name.clone(),
        service_name,
        device_id,
        addresses: info.get_addresses().iter().copied().collect(),
        port: info.get_port(),
        version: txt("version"),
        fingerprint_sha256: txt("fingerprint_sha256"),
        public_key,
        signing_public_key,
        last_seen: Utc::now(),
    })
}

fn dedup_key(peer: &DiscoveredPeer) -> String {
    match &peer.device_id {
        Some(id) => format!("id:{}", id),
        None => format!("name:{}", peer.service_name),
    }
}

/// First label of the full service name with any ` (N)` interface
/// disambiguator stripped
fn normalize_service_name(fullname: &str) -> String {
    let label = fullname.split('.').next().unwrap_or(fullname);

    if let Some(open) = label.rfind(" (") {
        let tail = &label[open + 2..];
        if let Some(inner) = tail.strip_suffix(')') {
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                return label[..open].to_string();
            }
        }
    }
    label.to_string()
}

/// Get local IP addresses (non-loopback)
pub fn get_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();

    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if !iface.is_loopback() {
                ips.push(iface.ip());
            }
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticSecret;

    #[test]
    fn test_normalize_service_name_strips_disambiguator() {
        assert_eq!(
            normalize_service_name("laptop-aabbccdd (2)._hypo._tcp.local."),
            "laptop-aabbccdd"
        );
        assert_eq!(
            normalize_service_name("laptop-aabbccdd._hypo._tcp.local."),
            "laptop-aabbccdd"
        );
        // Parenthesized words that are not counters stay
        assert_eq!(
            normalize_service_name("laptop (home)._hypo._tcp.local."),
            "laptop (home)"
        );
    }

    #[test]
    fn test_dedup_key_prefers_device_id() {
        let id = DeviceId::generate();
        let peer = DiscoveredPeer {
            service_name: "laptop".to_string(),
            device_id: Some(id.clone()),
            device_name: "laptop".to_string(),
            addresses: vec![],
            port: 7010,
            version: None,
            fingerprint_sha256: None,
            public_key: None,
            signing_public_key: None,
            last_seen: Utc::now(),
        };
        assert_eq!(dedup_key(&peer), format!("id:{}", id));

        let anonymous = DiscoveredPeer {
            device_id: None,
            ..peer
        };
        assert_eq!(dedup_key(&anonymous), "name:laptop");
    }

    #[test]
    fn test_auto_pairable_requires_id_and_key() {
        let mut peer = DiscoveredPeer {
            service_name: "phone".to_string(),
            device_id: Some(DeviceId::generate()),
            device_name: "phone".to_string(),
            addresses: vec![],
            port: 7010,
            version: None,
            fingerprint_sha256: None,
            public_key: Some(StaticSecret::generate().public_key()),
            signing_public_key: None,
            last_seen: Utc::now(),
        };
        assert!(peer.auto_pairable());

        peer.public_key = None;
        assert!(!peer.auto_pairable());
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let service = DiscoveryService::new(DeviceId::generate()).unwrap();
        let old = DiscoveredPeer {
            service_name: "old".to_string(),
            device_id: Some(DeviceId::generate()),
            device_name: "old".to_string(),
            addresses: vec![],
            port: 7010,
            version: None,
            fingerprint_sha256: None,
            public_key: None,
            signing_public_key: None,
            last_seen: Utc::now() - chrono::Duration::minutes(10),
        };
        let key = dedup_key(&old);
        service.peers.write().await.insert(key.clone(), old);

        let removed = service
            .prune_stale(Utc::now() - chrono::Duration::minutes(5))
            .await;
        assert_eq!(removed, vec![key]);
        assert!(service.get_peers().await.is_empty());
    }

    #[test]
    fn test_get_local_ips() {
        let _ = get_local_ips();
    }
}
