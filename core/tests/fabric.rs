//! End-to-end tests over the sync fabric: envelopes travel from one
//! device's engine through the wire format into another device's inbound
//! path, ending in history and the pasteboard.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use hypo_core::clipboard::{start_observer, ClipboardContent, Pasteboard};
use hypo_core::coordinator::{CoordinatorEvent, CoordinatorNotice, EventSource, SyncCoordinator};
use hypo_core::crypto::serde_utils::encode_base64;
use hypo_core::crypto::SharedKey;
use hypo_core::discovery::DiscoveryService;
use hypo_core::engine::SyncEngine;
use hypo_core::framing::encode_frame;
use hypo_core::history::{HistoryStore, MemoryHistory, TransportOrigin};
use hypo_core::identity::{DeviceId, KeyStore, MasterKey};
use hypo_core::protocol::{EncryptionInfo, SyncEnvelope, SyncPayload};
use hypo_core::transport::{
    client_request, InboundEvent, LanServer, TransportKind, TransportManager,
};
use hypo_core::{Error, Result};

struct RecordingPasteboard {
    written: Mutex<Vec<ClipboardContent>>,
}

impl RecordingPasteboard {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
        })
    }

    fn last_written(&self) -> Option<ClipboardContent> {
        self.written.lock().unwrap().last().cloned()
    }
}

impl Pasteboard for RecordingPasteboard {
    fn can_read(&self) -> bool {
        false
    }
    fn read(&self) -> Result<Option<ClipboardContent>> {
        Ok(None)
    }
    fn write(&self, content: &ClipboardContent) -> Result<()> {
        self.written.lock().unwrap().push(content.clone());
        Ok(())
    }
}

/// One in-process device: key store, engine, coordinator, history
struct Device {
    id: DeviceId,
    key_store: Arc<KeyStore>,
    engine: Arc<SyncEngine>,
    coordinator: SyncCoordinator,
    history: Arc<MemoryHistory>,
    pasteboard: Arc<RecordingPasteboard>,
    notices_rx: mpsc::Receiver<CoordinatorNotice>,
    dir: PathBuf,
}

fn make_device(name: &str) -> Device {
    let dir = std::env::temp_dir().join(format!("hypo-fabric-{}", uuid::Uuid::new_v4()));
    let id = DeviceId::generate();

    let key_store =
        KeyStore::open(dir.join("keystore.enc"), MasterKey::from_bytes([42u8; 32])).unwrap();
    let history = Arc::new(MemoryHistory::new());
    let pasteboard = RecordingPasteboard::new();

    let discovery = Arc::new(DiscoveryService::new(id.clone()).unwrap());
    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let transport = TransportManager::new(
        id.clone(),
        discovery,
        None,
        inbound_tx,
        dir.join("peers.json"),
        None,
    );

    let engine = Arc::new(SyncEngine::new(
        id.clone(),
        name.to_string(),
        key_store.clone(),
        transport,
        false,
    ));

    let (_observer_rx, observer) = start_observer(
        pasteboard.clone() as Arc<dyn Pasteboard>,
        Duration::from_secs(3600),
    );

    let (notices_tx, notices_rx) = mpsc::channel(64);
    let coordinator = SyncCoordinator::start(
        id.clone(),
        name.to_string(),
        history.clone(),
        engine.clone(),
        key_store.clone(),
        pasteboard.clone(),
        Arc::new(observer),
        notices_tx,
    );

    Device {
        id,
        key_store,
        engine,
        coordinator,
        history,
        pasteboard,
        notices_rx,
        dir,
    }
}

impl Device {
    async fn next_stored(&mut self) -> hypo_core::ClipboardItem {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.notices_rx.recv())
                .await
                .expect("notice before timeout")
                .expect("coordinator alive")
            {
                CoordinatorNotice::Stored { item } => return item,
                _ => continue,
            }
        }
    }

    fn cleanup(self) {
        self.coordinator.abort();
        std::fs::remove_dir_all(self.dir).ok();
    }
}

/// Seal an envelope exactly as device `sender` would for the wire
fn sealed_envelope(
    sender: &Device,
    key: &SharedKey,
    content: &ClipboardContent,
) -> SyncEnvelope {
    let plaintext = serde_json::to_vec(&content.to_payload()).unwrap();
    let sealed = key.seal(&plaintext, sender.id.as_aad()).unwrap();
    SyncEnvelope::clipboard(SyncPayload {
        content_type: content.content_type(),
        ciphertext_b64: encode_base64(&sealed.ciphertext),
        device_id: sender.id.clone(),
        device_name: Some("sender".to_string()),
        target: None,
        encryption: EncryptionInfo {
            algorithm: EncryptionInfo::AES_256_GCM.to_string(),
            nonce_b64: encode_base64(&sealed.nonce),
            tag_b64: encode_base64(&sealed.tag),
        },
    })
}

/// Scenario: a text copy on A, delivered over the LAN wire format, becomes
/// B's pasteboard and a history row with LAN provenance, and B does not
/// re-broadcast.
#[tokio::test(flavor = "multi_thread")]
async fn text_copy_travels_a_to_b() {
    let a = make_device("device-a");
    let mut b = make_device("device-b");

    // Paired: both hold the same shared key under the other's id
    let key = SharedKey::generate();
    a.key_store.save(&b.id, &key).await.unwrap();
    b.key_store.save(&a.id, &key).await.unwrap();

    // B runs a LAN server; A connects as a WebSocket client and sends the
    // framed envelope, as its outbound worker would
    let server = LanServer::bind(0).await.unwrap();
    let port = server.port();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
    let server_handle = server.start(inbound_tx);

    let content = ClipboardContent::Text("Test from A".to_string());
    let envelope = sealed_envelope(&a, &key, &content);
    let frame = encode_frame(&serde_json::to_vec(&envelope).unwrap()).unwrap();

    let url = url::Url::parse(&format!("ws://127.0.0.1:{}/sync", port)).unwrap();
    let (mut ws, _) = connect_async(client_request(&url, &a.id).unwrap())
        .await
        .unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    // B's inbound path: classify, decode, coordinate
    let event = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let InboundEvent::Envelope {
        envelope: received,
        transport,
    } = event
    else {
        panic!("expected an envelope");
    };
    assert_eq!(transport, TransportKind::Lan);

    let incoming = b.engine.decode(&received).await.unwrap();
    assert_eq!(incoming.content, content);

    b.coordinator
        .sender()
        .send(CoordinatorEvent {
            content: incoming.content,
            source: EventSource::Remote {
                sender: incoming.sender,
                sender_name: incoming.sender_name,
                transport: transport.into(),
                encrypted: true,
            },
        })
        .await
        .unwrap();

    let item = b.next_stored().await;
    assert_eq!(item.origin_device_id, a.id);
    assert_eq!(item.transport_origin, TransportOrigin::Lan);
    assert_eq!(item.preview, "Test from A");

    // The content became B's pasteboard
    assert_eq!(b.pasteboard.last_written(), Some(content.clone()));

    // Echo-free: no broadcast notice follows for a received event
    let quiet = tokio::time::timeout(Duration::from_millis(200), b.notices_rx.recv()).await;
    assert!(quiet.is_err());

    // Received rows never carry the local device id
    assert_ne!(item.origin_device_id, b.id);

    server_handle.abort();
    a.cleanup();
    b.cleanup();
}

/// Law: decode(encode(payload)) == payload for the full engine path.
#[tokio::test(flavor = "multi_thread")]
async fn engine_roundtrip_law() {
    let a = make_device("device-a");
    let b = make_device("device-b");

    let key = SharedKey::generate();
    b.key_store.save(&a.id, &key).await.unwrap();

    for content in [
        ClipboardContent::Text("plain text".to_string()),
        ClipboardContent::Link("https://example.org/page".to_string()),
        ClipboardContent::Text("unicode: héllo wörld 📋".to_string()),
    ] {
        let envelope = sealed_envelope(&a, &key, &content);
        let incoming = b.engine.decode(&envelope).await.unwrap();
        assert_eq!(incoming.content, content);
    }

    a.cleanup();
    b.cleanup();
}

/// Law: an envelope whose sender is the local device produces no history
/// mutation and no outbound send.
#[tokio::test(flavor = "multi_thread")]
async fn echo_envelope_is_inert() {
    let mut b = make_device("device-b");

    b.coordinator
        .sender()
        .send(CoordinatorEvent {
            content: ClipboardContent::Text("echo".to_string()),
            source: EventSource::Remote {
                sender: b.id.clone(),
                sender_name: None,
                transport: TransportOrigin::Lan,
                encrypted: true,
            },
        })
        .await
        .unwrap();

    let quiet = tokio::time::timeout(Duration::from_millis(300), b.notices_rx.recv()).await;
    assert!(quiet.is_err());
    assert!(b.history.latest().await.unwrap().is_none());

    b.cleanup();
}

/// An envelope from an unpaired sender surfaces MissingKey and leaves no
/// history row.
#[tokio::test(flavor = "multi_thread")]
async fn unknown_sender_is_rejected() {
    let a = make_device("device-a");
    let b = make_device("device-b");

    // A was never paired with B (post-unpair state)
    let envelope = sealed_envelope(
        &a,
        &SharedKey::generate(),
        &ClipboardContent::Text("secret".to_string()),
    );

    let result = b.engine.decode(&envelope).await;
    assert!(matches!(result, Err(Error::MissingKey(_))));
    assert!(b.history.latest().await.unwrap().is_none());

    a.cleanup();
    b.cleanup();
}

/// Dedup idempotence: the same content twice leaves exactly one row whose
/// timestamp comes from the second event.
#[tokio::test(flavor = "multi_thread")]
async fn dedup_is_idempotent() {
    let mut b = make_device("device-b");
    let sender = DeviceId::generate();

    let event = || CoordinatorEvent {
        content: ClipboardContent::Text("twice".to_string()),
        source: EventSource::Remote {
            sender: sender.clone(),
            sender_name: Some("peer".to_string()),
            transport: TransportOrigin::Cloud,
            encrypted: true,
        },
    };

    b.coordinator.sender().send(event()).await.unwrap();
    let first = b.next_stored().await;

    b.coordinator.sender().send(event()).await.unwrap();
    let second = b.next_stored().await;

    let rows = b.history.list(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, second.id);
    assert!(second.created_at >= first.created_at);
    assert_eq!(rows[0].transport_origin, TransportOrigin::Cloud);

    b.cleanup();
}

/// Boundary: a frame of exactly the cap passes; one byte more fails on
/// both encode and enqueue paths.
#[test]
fn frame_size_boundaries() {
    use hypo_core::protocol::constants::MAX_FRAME_SIZE;

    assert!(encode_frame(&vec![0u8; MAX_FRAME_SIZE]).is_ok());
    assert!(matches!(
        encode_frame(&vec![0u8; MAX_FRAME_SIZE + 1]),
        Err(Error::PayloadTooLarge { .. })
    ));
}
