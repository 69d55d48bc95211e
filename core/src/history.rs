//! Clipboard history rows and the external history store seam
//!
//! Rows are owned by the embedding platform's store (SQLite, Core Data,
//! Room, ...); the fabric mutates them through [`HistoryStore`]. The
//! in-memory implementation backs the CLI and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clipboard::ClipboardContent;
use crate::identity::DeviceId;
use crate::protocol::{ContentMetadata, ContentType};
use crate::Result;

/// Which transport delivered an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportOrigin {
    Lan,
    Cloud,
    Local,
}

/// One history row
#[derive(Debug, Clone)]
pub struct ClipboardItem {
    pub id: Uuid,
    pub content: ClipboardContent,
    pub preview: String,
    pub metadata: ContentMetadata,
    pub origin_device_id: DeviceId,
    pub origin_device_name: String,
    pub created_at: DateTime<Utc>,
    pub is_pinned: bool,
    pub is_encrypted: bool,
    pub transport_origin: TransportOrigin,
}

impl ClipboardItem {
    /// Build a fresh row for content observed or received now
    pub fn new(
        content: ClipboardContent,
        origin_device_id: DeviceId,
        origin_device_name: String,
        transport_origin: TransportOrigin,
    ) -> Self {
        let preview = content.preview();
        let metadata = content.metadata();
        Self {
            id: Uuid::new_v4(),
            content,
            preview,
            metadata,
            origin_device_id,
            origin_device_name,
            created_at: Utc::now(),
            is_pinned: false,
            is_encrypted: false,
            transport_origin,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content.content_type()
    }

    /// Content match for dedup: same type and byte-equal (text/link) or
    /// hash-equal (image/file)
    pub fn matches_content(&self, content: &ClipboardContent) -> bool {
        self.content.matches(content)
    }
}

/// External history store interface
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or replace a row by id
    async fn upsert(&self, item: ClipboardItem) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// The most recently created row (ignores pinning)
    async fn latest(&self) -> Result<Option<ClipboardItem>>;

    /// Any row whose content matches, newest first
    async fn find_matching(&self, content: &ClipboardContent) -> Result<Option<ClipboardItem>>;

    /// Rows in display order: pinned first, then by recency
    async fn list(&self, limit: usize) -> Result<Vec<ClipboardItem>>;
}

/// In-memory history store
#[derive(Default)]
pub struct MemoryHistory {
    rows: tokio::sync::RwLock<Vec<ClipboardItem>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn upsert(&self, item: ClipboardItem) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.retain(|row| row.id != item.id);
        rows.push(item);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.rows.write().await.retain(|row| row.id != id);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<ClipboardItem>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().max_by_key(|row| row.created_at).cloned())
    }

    async fn find_matching(&self, content: &ClipboardContent) -> Result<Option<ClipboardItem>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|row| row.matches_content(content))
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ClipboardItem>> {
        let rows = self.rows.read().await;
        let mut sorted: Vec<ClipboardItem> = rows.clone();
        sorted.sort_by(|a, b| {
            b.is_pinned
                .cmp(&a.is_pinned)
                .then(b.created_at.cmp(&a.created_at))
        });
        sorted.truncate(limit);
        Ok(sorted)
    }
}
