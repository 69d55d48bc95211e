//! Local pasteboard observer
//!
//! Polls the platform pasteboard, normalizes changes into
//! [`ClipboardContent`], and suppresses OS-level echo storms by comparing
//! the SHA-256 signature against the last emitted one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arboard::Clipboard as ArboardClipboard;
use tokio::sync::mpsc;

use crate::clipboard::{ClipboardContent, ImageContent, ImageFormat};
use crate::{Error, Result};

/// Platform pasteboard seam.
///
/// Implementations must never panic on denied reads; platforms that gate
/// clipboard access behind focus report it through `can_read`.
pub trait Pasteboard: Send + Sync {
    fn can_read(&self) -> bool;
    fn read(&self) -> Result<Option<ClipboardContent>>;
    fn write(&self, content: &ClipboardContent) -> Result<()>;
}

/// `arboard`-backed pasteboard used by the CLI and desktop builds
pub struct ArboardPasteboard;

impl Pasteboard for ArboardPasteboard {
    fn can_read(&self) -> bool {
        ArboardClipboard::new().is_ok()
    }

    fn read(&self) -> Result<Option<ClipboardContent>> {
        let mut clipboard =
            ArboardClipboard::new().map_err(|e| Error::Clipboard(e.to_string()))?;

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => {
                return Ok(Some(ClipboardContent::from_text(text)));
            }
            Ok(_) => {}
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => return Err(Error::Clipboard(e.to_string())),
        }

        match clipboard.get_image() {
            Ok(img) => {
                let encoded = encode_rgba_as_png(&img)?;
                Ok(Some(ClipboardContent::Image(ImageContent {
                    bytes: encoded,
                    width: img.width as u32,
                    height: img.height as u32,
                    format: ImageFormat::Png,
                    thumbnail: None,
                })))
            }
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::Clipboard(e.to_string())),
        }
    }

    fn write(&self, content: &ClipboardContent) -> Result<()> {
        let mut clipboard =
            ArboardClipboard::new().map_err(|e| Error::Clipboard(e.to_string()))?;

        match content {
            ClipboardContent::Text(text) => clipboard
                .set_text(text)
                .map_err(|e| Error::Clipboard(e.to_string())),
            ClipboardContent::Link(url) => clipboard
                .set_text(url)
                .map_err(|e| Error::Clipboard(e.to_string())),
            ClipboardContent::Image(image) => {
                let decoded = image::load_from_memory(&image.bytes)
                    .map_err(|e| Error::Clipboard(e.to_string()))?
                    .into_rgba8();
                let (width, height) = decoded.dimensions();
                clipboard
                    .set_image(arboard::ImageData {
                        width: width as usize,
                        height: height as usize,
                        bytes: decoded.into_raw().into(),
                    })
                    .map_err(|e| Error::Clipboard(e.to_string()))
            }
            ClipboardContent::File(file) => {
                // Portable pasteboards cannot hold file bodies; surface the
                // name so the paste at least points at the transfer
                clipboard
                    .set_text(&file.filename)
                    .map_err(|e| Error::Clipboard(e.to_string()))
            }
        }
    }
}

fn encode_rgba_as_png(img: &arboard::ImageData<'_>) -> Result<Vec<u8>> {
    let buffer = image::RgbaImage::from_raw(
        img.width as u32,
        img.height as u32,
        img.bytes.to_vec(),
    )
    .ok_or_else(|| Error::Clipboard("clipboard image has invalid dimensions".to_string()))?;

    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(buffer)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| Error::Clipboard(e.to_string()))?;
    Ok(out)
}

/// A deduplicated pasteboard change
#[derive(Debug, Clone)]
pub struct ClipboardChange {
    pub content: ClipboardContent,
    pub hash: String,
}

/// Events emitted by the observer task
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Changed(ClipboardChange),
    /// The platform denied the read (e.g. app not focused); the embedding
    /// service should surface an action instead of crashing
    ReadDenied,
    /// Content was dropped for exceeding a local size cap
    TooLarge { size: usize, max: usize },
}

/// Handle to the running observer task
pub struct ClipboardObserver {
    last_hash: Arc<Mutex<Option<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl ClipboardObserver {
    /// Record a hash we just wrote ourselves so the next poll does not
    /// re-emit it as a local change
    pub fn mark_written(&self, hash: &str) {
        *self.last_hash.lock().expect("observer hash lock poisoned") = Some(hash.to_string());
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start the observer task polling `pasteboard` at `poll_interval`
pub fn start_observer(
    pasteboard: Arc<dyn Pasteboard>,
    poll_interval: Duration,
) -> (mpsc::Receiver<ObserverEvent>, ClipboardObserver) {
    let (tx, rx) = mpsc::channel(16);
    let last_hash: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let task_hash = last_hash.clone();

    let task = tokio::spawn(async move {
        let mut denied_reported = false;

        loop {
            tokio::time::sleep(poll_interval).await;

            if !pasteboard.can_read() {
                if !denied_reported {
                    denied_reported = true;
                    tracing::warn!("clipboard read denied by platform");
                    if tx.send(ObserverEvent::ReadDenied).await.is_err() {
                        break;
                    }
                }
                continue;
            }
            denied_reported = false;

            let content = match pasteboard.read() {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("clipboard read error: {}", e);
                    continue;
                }
            };

            let hash = content.hash_hex();
            {
                let mut last = task_hash.lock().expect("observer hash lock poisoned");
                if last.as_deref() == Some(hash.as_str()) {
                    continue;
                }
                *last = Some(hash.clone());
            }

            let event = match content.enforce_size_caps() {
                Ok(content) => {
                    // Recompression may have changed the signature
                    let hash = content.hash_hex();
                    ObserverEvent::Changed(ClipboardChange { content, hash })
                }
                Err(crate::Error::PayloadTooLarge { size, max }) => {
                    ObserverEvent::TooLarge { size, max }
                }
                Err(e) => {
                    tracing::warn!("clipboard content rejected: {}", e);
                    continue;
                }
            };

            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    (
        rx,
        ClipboardObserver {
            last_hash,
            task,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted pasteboard for observer tests
    struct FakePasteboard {
        reads: Mutex<VecDeque<Option<ClipboardContent>>>,
        can_read: bool,
    }

    impl FakePasteboard {
        fn new(reads: Vec<Option<ClipboardContent>>, can_read: bool) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
                can_read,
            })
        }
    }

    impl Pasteboard for FakePasteboard {
        fn can_read(&self) -> bool {
            self.can_read
        }

        fn read(&self) -> Result<Option<ClipboardContent>> {
            let mut reads = self.reads.lock().unwrap();
            Ok(reads.pop_front().flatten())
        }

        fn write(&self, _content: &ClipboardContent) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_emits_change_once_per_content() {
        let text = ClipboardContent::Text("hello".to_string());
        let pasteboard = FakePasteboard::new(
            vec![Some(text.clone()), Some(text.clone()), Some(text.clone())],
            true,
        );

        let (mut rx, observer) = start_observer(pasteboard, Duration::from_millis(5));

        let event = rx.recv().await.unwrap();
        match event {
            ObserverEvent::Changed(change) => assert_eq!(change.content, text),
            other => panic!("unexpected event: {:?}", other),
        }

        // The two repeat reads must not produce further events
        let quiet =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(quiet.is_err());
        observer.abort();
    }

    #[tokio::test]
    async fn test_mark_written_suppresses_echo() {
        let text = ClipboardContent::Text("incoming".to_string());
        let pasteboard = FakePasteboard::new(vec![Some(text.clone())], true);

        let (mut rx, observer) = start_observer(pasteboard, Duration::from_millis(20));
        observer.mark_written(&text.hash_hex());

        let quiet =
            tokio::time::timeout(Duration::from_millis(120), rx.recv()).await;
        assert!(quiet.is_err());
        observer.abort();
    }

    #[tokio::test]
    async fn test_read_denied_reported_once() {
        let pasteboard = FakePasteboard::new(vec![], false);
        let (mut rx, observer) = start_observer(pasteboard, Duration::from_millis(5));

        assert!(matches!(
            rx.recv().await.unwrap(),
            ObserverEvent::ReadDenied
        ));
        let quiet =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(quiet.is_err());
        observer.abort();
    }

    #[tokio::test]
    async fn test_oversized_file_reported() {
        use crate::clipboard::FileContent;
        use crate::protocol::constants::MAX_FILE_LOCAL_SIZE;

        let huge = ClipboardContent::File(FileContent {
            bytes: vec![0u8; MAX_FILE_LOCAL_SIZE + 1],
            filename: "huge.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        let pasteboard = FakePasteboard::new(vec![Some(huge)], true);

        let (mut rx, observer) = start_observer(pasteboard, Duration::from_millis(5));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ObserverEvent::TooLarge { .. }
        ));
        observer.abort();
    }
}
