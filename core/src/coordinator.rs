//! Sync coordinator: the single writer over clipboard and incoming-sync
//! events
//!
//! All history mutation happens on this actor's task, so dedup and upsert
//! are always ordered before broadcast for a given event. Incoming events
//! carry `skip_broadcast` semantics through their source and are never
//! re-transmitted.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::clipboard::{ClipboardContent, ClipboardObserver, Pasteboard};
use crate::engine::SyncEngine;
use crate::history::{ClipboardItem, HistoryStore, TransportOrigin};
use crate::identity::{DeviceId, KeyStore};
use crate::protocol::constants::{EMPTY_TARGET_WAIT, MAX_FANOUT_CONCURRENCY};
use crate::transport::TransportKind;
use crate::Result;

/// Where a clipboard event came from
#[derive(Debug, Clone)]
pub enum EventSource {
    /// Observed on the local pasteboard
    Local,
    /// Delivered by a peer; implies skip-broadcast
    Remote {
        sender: DeviceId,
        sender_name: Option<String>,
        transport: TransportOrigin,
        encrypted: bool,
    },
}

/// One unit of work for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorEvent {
    pub content: ClipboardContent,
    pub source: EventSource,
}

/// Per-target outcome of a fan-out
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered(TransportKind),
    Failed(String),
}

/// What the coordinator reports upward
#[derive(Debug, Clone)]
pub enum CoordinatorNotice {
    /// A row was written (new or refreshed)
    Stored { item: ClipboardItem },
    /// Fan-out finished; individual failures do not abort others
    Broadcast {
        item_id: Uuid,
        outcomes: Vec<(DeviceId, SendOutcome)>,
    },
    /// No targets appeared within the wait window
    NoTargets { item_id: Uuid },
    /// Writing an incoming item to the local pasteboard failed
    PasteboardWriteFailed { reason: String },
}

/// Handle to the coordinator actor
pub struct SyncCoordinator {
    events_tx: mpsc::Sender<CoordinatorEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        local_id: DeviceId,
        local_name: String,
        history: Arc<dyn HistoryStore>,
        engine: Arc<SyncEngine>,
        key_store: Arc<KeyStore>,
        pasteboard: Arc<dyn Pasteboard>,
        observer: Arc<ClipboardObserver>,
        notices_tx: mpsc::Sender<CoordinatorNotice>,
    ) -> Self {
        let (events_tx, mut events_rx) = mpsc::channel::<CoordinatorEvent>(64);

        let worker = Worker {
            local_id,
            local_name,
            history,
            engine,
            key_store,
            pasteboard,
            observer,
            notices_tx,
        };

        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(e) = worker.handle(event).await {
                    tracing::warn!("coordinator event failed: {}", e);
                }
            }
        });

        Self { events_tx, task }
    }

    /// Submit an event; all callers funnel through this one channel
    pub fn sender(&self) -> mpsc::Sender<CoordinatorEvent> {
        self.events_tx.clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct Worker {
    local_id: DeviceId,
    local_name: String,
    history: Arc<dyn HistoryStore>,
    engine: Arc<SyncEngine>,
    key_store: Arc<KeyStore>,
    pasteboard: Arc<dyn Pasteboard>,
    observer: Arc<ClipboardObserver>,
    notices_tx: mpsc::Sender<CoordinatorNotice>,
}

impl Worker {
    async fn handle(&self, event: CoordinatorEvent) -> Result<()> {
        // Loopback guard: our own id as sender means an echo
        if let EventSource::Remote { sender, .. } = &event.source {
            if *sender == self.local_id {
                tracing::debug!("dropping loopback event");
                return Ok(());
            }
        }

        let skip_broadcast = matches!(event.source, EventSource::Remote { .. });

        // Dedup and upsert happen before any broadcast, on this task only
        let item = self.upsert_deduplicated(&event).await?;

        if let EventSource::Remote { .. } = &event.source {
            // Incoming content becomes the live pasteboard; mark the hash
            // first so the observer does not re-emit it as a local change
            self.observer.mark_written(&item.content.hash_hex());
            if let Err(e) = self.pasteboard.write(&item.content) {
                let _ = self
                    .notices_tx
                    .send(CoordinatorNotice::PasteboardWriteFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
        }

        let _ = self
            .notices_tx
            .send(CoordinatorNotice::Stored { item: item.clone() })
            .await;

        if skip_broadcast {
            return Ok(());
        }

        self.broadcast(item).await;
        Ok(())
    }

    /// Resolve duplicates without time windows: a matching row anywhere in
    /// history is removed and reinserted fresh at the top, preserving its
    /// pin and encryption flags. Origin fields survive only for local
    /// events; remote events restamp them from the sender.
    async fn upsert_deduplicated(&self, event: &CoordinatorEvent) -> Result<ClipboardItem> {
        let existing = self.history.find_matching(&event.content).await?;

        let (origin_id, origin_name, transport, encrypted) = match &event.source {
            EventSource::Local => (
                self.local_id.clone(),
                self.local_name.clone(),
                TransportOrigin::Local,
                false,
            ),
            EventSource::Remote {
                sender,
                sender_name,
                transport,
                encrypted,
            } => (
                sender.clone(),
                sender_name.clone().unwrap_or_else(|| sender.to_string()),
                *transport,
                *encrypted,
            ),
        };

        let mut fresh = ClipboardItem::new(
            event.content.clone(),
            origin_id,
            origin_name,
            transport,
        );
        fresh.is_encrypted = encrypted;

        if let Some(row) = existing {
            self.history.delete(row.id).await?;
            fresh.is_pinned = row.is_pinned;
            fresh.is_encrypted = row.is_encrypted;
            if matches!(event.source, EventSource::Local) {
                // A local re-copy of remembered content keeps its provenance
                fresh.transport_origin = row.transport_origin;
                fresh.origin_device_id = row.origin_device_id;
                fresh.origin_device_name = row.origin_device_name;
            }
        }

        self.history.upsert(fresh.clone()).await?;
        Ok(fresh)
    }

    async fn broadcast(&self, item: ClipboardItem) {
        let targets = self.wait_for_targets().await;
        if targets.is_empty() {
            tracing::debug!("no paired targets for broadcast");
            let _ = self
                .notices_tx
                .send(CoordinatorNotice::NoTargets { item_id: item.id })
                .await;
            return;
        }

        // Parallel fan-out, bounded; default concurrency is the target
        // count capped at the fan-out limit
        let limit = targets.len().min(MAX_FANOUT_CONCURRENCY).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut joins = JoinSet::new();

        for target in targets {
            let engine = self.engine.clone();
            let content = item.content.clone();
            let semaphore = semaphore.clone();
            joins.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("fan-out semaphore is never closed");
                let outcome = match engine.send(&content, &target).await {
                    Ok(kind) => SendOutcome::Delivered(kind),
                    Err(e) => SendOutcome::Failed(e.to_string()),
                };
                (target, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((target, outcome)) => {
                    if let SendOutcome::Failed(reason) = &outcome {
                        tracing::warn!(target = %target, "send failed: {}", reason);
                    }
                    outcomes.push((target, outcome));
                }
                Err(e) => tracing::warn!("fan-out task panicked: {}", e),
            }
        }

        let _ = self
            .notices_tx
            .send(CoordinatorNotice::Broadcast {
                item_id: item.id,
                outcomes,
            })
            .await;
    }

    /// The target set is the paired peers from the key store minus
    /// ourselves. An empty set right after pairing is a race, not a fact;
    /// wait for the key store to change before giving up.
    async fn wait_for_targets(&self) -> Vec<DeviceId> {
        let mut generation = self.key_store.subscribe();
        let deadline = tokio::time::Instant::now() + EMPTY_TARGET_WAIT;

        loop {
            let targets: Vec<DeviceId> = self
                .key_store
                .list()
                .await
                .into_iter()
                .filter(|id| *id != self.local_id)
                .collect();
            if !targets.is_empty() {
                return targets;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            match tokio::time::timeout(remaining, generation.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::start_observer;
    use crate::discovery::DiscoveryService;
    use crate::history::MemoryHistory;
    use crate::identity::MasterKey;
    use crate::transport::TransportManager;
    use std::path::PathBuf;
    use std::time::Duration;

    struct NullPasteboard {
        written: std::sync::Mutex<Vec<ClipboardContent>>,
    }

    impl Pasteboard for NullPasteboard {
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

    struct Fixture {
        coordinator: SyncCoordinator,
        history: Arc<MemoryHistory>,
        pasteboard: Arc<NullPasteboard>,
        notices_rx: mpsc::Receiver<CoordinatorNotice>,
        local_id: DeviceId,
        dir: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = std::env::temp_dir().join(format!("hypo-coord-{}", uuid::Uuid::new_v4()));
        let local_id = DeviceId::generate();

        let key_store = KeyStore::open(
            dir.join("keystore.enc"),
            MasterKey::from_bytes([5u8; 32]),
        )
        .unwrap();

        // A paired (but unreachable) peer so broadcasts fail fast instead
        // of sitting out the empty-target wait
        key_store
            .save(&DeviceId::generate(), &crate::crypto::SharedKey::generate())
            .await
            .unwrap();
        let history = Arc::new(MemoryHistory::new());
        let pasteboard = Arc::new(NullPasteboard {
            written: std::sync::Mutex::new(Vec::new()),
        });

        let discovery = Arc::new(DiscoveryService::new(local_id.clone()).unwrap());
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let transport = TransportManager::new(
            local_id.clone(),
            discovery,
            None,
            inbound_tx,
            dir.join("peers.json"),
            None,
        );
        let engine = Arc::new(SyncEngine::new(
            local_id.clone(),
            "local".to_string(),
            key_store.clone(),
            transport,
            false,
        ));

        let (_observer_rx, observer) = start_observer(
            pasteboard.clone() as Arc<dyn Pasteboard>,
            Duration::from_secs(3600),
        );

        let (notices_tx, notices_rx) = mpsc::channel(32);
        let coordinator = SyncCoordinator::start(
            local_id.clone(),
            "local".to_string(),
            history.clone(),
            engine,
            key_store,
            pasteboard.clone(),
            Arc::new(observer),
            notices_tx,
        );

        Fixture {
            coordinator,
            history,
            pasteboard,
            notices_rx,
            local_id,
            dir,
        }
    }

    fn local_event(text: &str) -> CoordinatorEvent {
        CoordinatorEvent {
            content: ClipboardContent::Text(text.to_string()),
            source: EventSource::Local,
        }
    }

    fn remote_event(text: &str, sender: DeviceId) -> CoordinatorEvent {
        CoordinatorEvent {
            content: ClipboardContent::Text(text.to_string()),
            source: EventSource::Remote {
                sender,
                sender_name: Some("remote".to_string()),
                transport: TransportOrigin::Lan,
                encrypted: true,
            },
        }
    }

    async fn next_stored(rx: &mut mpsc::Receiver<CoordinatorNotice>) -> ClipboardItem {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                CoordinatorNotice::Stored { item } => return item,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_local_event_inserts_row() {
        let mut f = fixture().await;
        f.coordinator
            .sender()
            .send(local_event("hello"))
            .await
            .unwrap();

        let item = next_stored(&mut f.notices_rx).await;
        assert_eq!(item.origin_device_id, f.local_id);
        assert_eq!(item.transport_origin, TransportOrigin::Local);
        assert_eq!(f.history.list(10).await.unwrap().len(), 1);
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_dedup_leaves_single_row_at_top() {
        let mut f = fixture().await;
        let tx = f.coordinator.sender();

        tx.send(local_event("dup")).await.unwrap();
        let first = next_stored(&mut f.notices_rx).await;

        tx.send(local_event("other")).await.unwrap();
        next_stored(&mut f.notices_rx).await;

        tx.send(local_event("dup")).await.unwrap();
        let second = next_stored(&mut f.notices_rx).await;

        let rows = f.history.list(10).await.unwrap();
        let matching: Vec<_> = rows
            .iter()
            .filter(|r| r.matches_content(&ClipboardContent::Text("dup".to_string())))
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(second.created_at >= first.created_at);
        // The refreshed row is the newest
        let latest = f.history.latest().await.unwrap().unwrap();
        assert!(latest.matches_content(&ClipboardContent::Text("dup".to_string())));
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_dedup_preserves_pin() {
        let mut f = fixture().await;
        let tx = f.coordinator.sender();

        tx.send(local_event("pinme")).await.unwrap();
        let item = next_stored(&mut f.notices_rx).await;

        // Pin the row out of band, as the UI would
        let mut pinned = item.clone();
        pinned.is_pinned = true;
        f.history.upsert(pinned).await.unwrap();

        tx.send(local_event("pinme")).await.unwrap();
        let refreshed = next_stored(&mut f.notices_rx).await;
        assert!(refreshed.is_pinned);
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_remote_event_writes_pasteboard_and_keeps_origin() {
        let mut f = fixture().await;
        let sender = DeviceId::generate();
        f.coordinator
            .sender()
            .send(remote_event("incoming", sender.clone()))
            .await
            .unwrap();

        let item = next_stored(&mut f.notices_rx).await;
        assert_eq!(item.origin_device_id, sender);
        assert_eq!(item.transport_origin, TransportOrigin::Lan);
        assert!(item.is_encrypted);

        let written = f.pasteboard.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_remote_event_never_broadcasts() {
        let mut f = fixture().await;
        f.coordinator
            .sender()
            .send(remote_event("incoming", DeviceId::generate()))
            .await
            .unwrap();

        next_stored(&mut f.notices_rx).await;
        // No Broadcast or NoTargets notice may follow for a remote event
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), f.notices_rx.recv()).await;
        assert!(quiet.is_err());
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_loopback_event_is_dropped() {
        let mut f = fixture().await;
        f.coordinator
            .sender()
            .send(remote_event("echo", f.local_id.clone()))
            .await
            .unwrap();

        let quiet =
            tokio::time::timeout(Duration::from_millis(200), f.notices_rx.recv()).await;
        assert!(quiet.is_err());
        assert!(f.history.latest().await.unwrap().is_none());
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }

    #[tokio::test]
    async fn test_local_recopy_of_remote_content_keeps_provenance() {
        let mut f = fixture().await;
        let sender = DeviceId::generate();
        let tx = f.coordinator.sender();

        tx.send(remote_event("shared", sender.clone())).await.unwrap();
        next_stored(&mut f.notices_rx).await;

        // User re-copies the same content locally
        tx.send(local_event("shared")).await.unwrap();
        let refreshed = next_stored(&mut f.notices_rx).await;

        assert_eq!(refreshed.origin_device_id, sender);
        assert_eq!(refreshed.transport_origin, TransportOrigin::Lan);
        f.coordinator.abort();
        std::fs::remove_dir_all(f.dir).ok();
    }
}
