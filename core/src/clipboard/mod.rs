//! Clipboard content model: parsing, canonical bytes, dedup signatures,
//! and size enforcement

mod observer;

pub use observer::{
    start_observer, ArboardPasteboard, ClipboardChange, ClipboardObserver, ObserverEvent,
    Pasteboard,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::protocol::constants::{
    MAX_FILE_LOCAL_SIZE, MAX_FILE_TRANSFER_SIZE, MAX_IMAGE_SIZE, PREVIEW_MAX_CHARS,
};
use crate::protocol::{ClipboardPayload, ContentMetadata, ContentType};
use crate::{Error, Result};

/// Image formats accepted on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
}

impl ImageFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Gif => "image/gif",
        }
    }

    pub fn from_mime(mime: &str) -> Result<Self> {
        match mime {
            "image/png" => Ok(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
            "image/webp" => Ok(ImageFormat::Webp),
            "image/gif" => Ok(ImageFormat::Gif),
            other => Err(Error::Clipboard(format!("unsupported image mime: {}", other))),
        }
    }
}

/// Image clipboard entry
#[derive(Debug, Clone, PartialEq)]
pub struct ImageContent {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub thumbnail: Option<Vec<u8>>,
}

/// File clipboard entry
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime: String,
}

/// Parsed clipboard content
#[derive(Debug, Clone, PartialEq)]
pub enum ClipboardContent {
    Text(String),
    Link(String),
    Image(ImageContent),
    File(FileContent),
}

impl ClipboardContent {
    /// Normalize pasted text: single-line absolute http(s) URLs become links
    pub fn from_text(text: String) -> Self {
        let trimmed = text.trim();
        if !trimmed.contains(char::is_whitespace) {
            if let Ok(url) = Url::parse(trimmed) {
                if matches!(url.scheme(), "http" | "https") && url.host().is_some() {
                    return ClipboardContent::Link(trimmed.to_string());
                }
            }
        }
        ClipboardContent::Text(text)
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            ClipboardContent::Text(_) => ContentType::Text,
            ClipboardContent::Link(_) => ContentType::Link,
            ClipboardContent::Image(_) => ContentType::Image,
            ClipboardContent::File(_) => ContentType::File,
        }
    }

    /// The bytes that define this content: UTF-8 for text and links, the
    /// encoded body for images and files. Hashed for dedup and carried as
    /// `data_base64` on the wire.
    pub fn canonical_bytes(&self) -> &[u8] {
        match self {
            ClipboardContent::Text(text) => text.as_bytes(),
            ClipboardContent::Link(url) => url.as_bytes(),
            ClipboardContent::Image(image) => &image.bytes,
            ClipboardContent::File(file) => &file.bytes,
        }
    }

    /// Hex SHA-256 over the canonical bytes
    pub fn hash_hex(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    pub fn size(&self) -> usize {
        self.canonical_bytes().len()
    }

    /// Content equality for history dedup: same type, and byte-equal for
    /// text/link or hash-equal for image/file
    pub fn matches(&self, other: &ClipboardContent) -> bool {
        match (self, other) {
            (ClipboardContent::Text(a), ClipboardContent::Text(b)) => a == b,
            (ClipboardContent::Link(a), ClipboardContent::Link(b)) => a == b,
            (ClipboardContent::Image(_), ClipboardContent::Image(_))
            | (ClipboardContent::File(_), ClipboardContent::File(_)) => {
                self.hash_hex() == other.hash_hex()
            }
            _ => false,
        }
    }

    /// History preview, truncated on a char boundary
    pub fn preview(&self) -> String {
        let text = match self {
            ClipboardContent::Text(text) => text.trim().to_string(),
            ClipboardContent::Link(url) => url.clone(),
            ClipboardContent::Image(image) => {
                format!("Image {}x{} ({})", image.width, image.height, image.format.mime())
            }
            ClipboardContent::File(file) => file.filename.clone(),
        };
        text.chars().take(PREVIEW_MAX_CHARS).collect()
    }

    pub fn metadata(&self) -> ContentMetadata {
        let mut metadata = ContentMetadata {
            hash: self.hash_hex(),
            size: self.size() as u64,
            ..ContentMetadata::default()
        };
        match self {
            ClipboardContent::Image(image) => {
                metadata.mime = Some(image.format.mime().to_string());
                metadata.width = Some(image.width);
                metadata.height = Some(image.height);
            }
            ClipboardContent::File(file) => {
                metadata.mime = Some(file.mime.clone());
                metadata.filename = Some(file.filename.clone());
            }
            _ => {}
        }
        metadata
    }

    /// Build the plaintext wire payload
    pub fn to_payload(&self) -> ClipboardPayload {
        ClipboardPayload {
            content_type: self.content_type(),
            data_base64: crate::crypto::serde_utils::encode_base64_no_pad(self.canonical_bytes()),
            metadata: self.metadata(),
        }
    }

    /// Reconstruct content from a decoded wire payload
    pub fn from_payload(payload: &ClipboardPayload) -> Result<Self> {
        let bytes = crate::crypto::serde_utils::decode_base64_tolerant(&payload.data_base64)?;
        match payload.content_type {
            ContentType::Text => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| Error::PayloadMalformed("text is not UTF-8".to_string()))?;
                Ok(ClipboardContent::Text(text))
            }
            ContentType::Link => {
                let url = String::from_utf8(bytes)
                    .map_err(|_| Error::PayloadMalformed("link is not UTF-8".to_string()))?;
                Ok(ClipboardContent::Link(url))
            }
            ContentType::Image => {
                let format = payload
                    .metadata
                    .mime
                    .as_deref()
                    .map(ImageFormat::from_mime)
                    .transpose()?
                    .unwrap_or(ImageFormat::Png);
                Ok(ClipboardContent::Image(ImageContent {
                    bytes,
                    width: payload.metadata.width.unwrap_or(0),
                    height: payload.metadata.height.unwrap_or(0),
                    format,
                    thumbnail: None,
                }))
            }
            ContentType::File => Ok(ClipboardContent::File(FileContent {
                bytes,
                filename: payload
                    .metadata
                    .filename
                    .clone()
                    .unwrap_or_else(|| "clipboard.bin".to_string()),
                mime: payload
                    .metadata
                    .mime
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            })),
        }
    }

    /// True when the content fits the on-wire transfer caps
    pub fn transferable(&self) -> bool {
        match self {
            ClipboardContent::File(file) => file.bytes.len() <= MAX_FILE_TRANSFER_SIZE,
            ClipboardContent::Image(image) => image.bytes.len() <= MAX_IMAGE_SIZE,
            _ => true,
        }
    }

    /// Enforce local size caps, recompressing oversized images.
    ///
    /// Files above the local-copy cap and images that will not compress
    /// under the image cap are rejected outright; files between the
    /// transfer and local caps are kept (history only, never sent).
    pub fn enforce_size_caps(self) -> Result<Self> {
        match self {
            ClipboardContent::Image(image) if image.bytes.len() > MAX_IMAGE_SIZE => {
                let recompressed = recompress_image(image)?;
                Ok(ClipboardContent::Image(recompressed))
            }
            ClipboardContent::File(ref file) if file.bytes.len() > MAX_FILE_LOCAL_SIZE => {
                Err(Error::PayloadTooLarge {
                    size: file.bytes.len(),
                    max: MAX_FILE_LOCAL_SIZE,
                })
            }
            other => Ok(other),
        }
    }
}

/// JPEG quality ladder tried when an image exceeds the wire cap
const RECOMPRESS_QUALITIES: &[u8] = &[85, 70, 55, 40];

fn recompress_image(content: ImageContent) -> Result<ImageContent> {
    let decoded = image::load_from_memory(&content.bytes)
        .map_err(|e| Error::Clipboard(format!("cannot decode image: {}", e)))?;
    let rgb = decoded.to_rgb8();

    for quality in RECOMPRESS_QUALITIES {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, *quality);
        encoder
            .encode_image(&rgb)
            .map_err(|e| Error::Clipboard(format!("cannot encode image: {}", e)))?;

        if out.len() <= MAX_IMAGE_SIZE {
            tracing::debug!(
                original = content.bytes.len(),
                recompressed = out.len(),
                quality,
                "recompressed oversized image"
            );
            return Ok(ImageContent {
                bytes: out,
                width: rgb.width(),
                height: rgb.height(),
                format: ImageFormat::Jpeg,
                thumbnail: content.thumbnail,
            });
        }
    }

    Err(Error::PayloadTooLarge {
        size: content.bytes.len(),
        max: MAX_IMAGE_SIZE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_detection() {
        assert!(matches!(
            ClipboardContent::from_text("https://example.org/page".to_string()),
            ClipboardContent::Link(_)
        ));
        assert!(matches!(
            ClipboardContent::from_text("plain words".to_string()),
            ClipboardContent::Text(_)
        ));
        // Relative or schemeless strings stay text
        assert!(matches!(
            ClipboardContent::from_text("example.org/page".to_string()),
            ClipboardContent::Text(_)
        ));
        // URLs inside prose stay text
        assert!(matches!(
            ClipboardContent::from_text("see https://example.org for details".to_string()),
            ClipboardContent::Text(_)
        ));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = ClipboardContent::Text("hello".to_string());
        let b = ClipboardContent::Text("hello".to_string());
        assert_eq!(a.hash_hex(), b.hash_hex());
        assert_eq!(a.hash_hex().len(), 64);
    }

    #[test]
    fn test_matches_requires_same_type() {
        let text = ClipboardContent::Text("https://example.org".to_string());
        let link = ClipboardContent::Link("https://example.org".to_string());
        assert!(!text.matches(&link));
    }

    #[test]
    fn test_matches_files_by_hash() {
        let a = ClipboardContent::File(FileContent {
            bytes: vec![1, 2, 3],
            filename: "a.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        let b = ClipboardContent::File(FileContent {
            bytes: vec![1, 2, 3],
            filename: "renamed.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        assert!(a.matches(&b));
    }

    #[test]
    fn test_preview_truncated() {
        let long = "x".repeat(500);
        let preview = ClipboardContent::Text(long).preview();
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS);
    }

    #[test]
    fn test_payload_roundtrip() {
        let content = ClipboardContent::Text("Test from A".to_string());
        let payload = content.to_payload();

        assert_eq!(payload.content_type, ContentType::Text);
        assert!(!payload.data_base64.contains('='));

        let restored = ClipboardContent::from_payload(&payload).unwrap();
        assert_eq!(restored, content);
    }

    #[test]
    fn test_file_payload_preserves_filename() {
        let content = ClipboardContent::File(FileContent {
            bytes: b"data".to_vec(),
            filename: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
        });
        let restored = ClipboardContent::from_payload(&content.to_payload()).unwrap();
        assert_eq!(restored, content);
    }

    #[test]
    fn test_file_transfer_cap() {
        let small = ClipboardContent::File(FileContent {
            bytes: vec![0u8; 1024],
            filename: "small.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        assert!(small.transferable());

        let large = ClipboardContent::File(FileContent {
            bytes: vec![0u8; MAX_FILE_TRANSFER_SIZE + 1],
            filename: "large.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        assert!(!large.transferable());
        // Over the transfer cap but under the local cap: kept
        assert!(large.enforce_size_caps().is_ok());
    }

    #[test]
    fn test_file_local_cap_rejected() {
        let huge = ClipboardContent::File(FileContent {
            bytes: vec![0u8; MAX_FILE_LOCAL_SIZE + 1],
            filename: "huge.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        });
        assert!(matches!(
            huge.enforce_size_caps(),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_image_under_cap_untouched() {
        let image = ClipboardContent::Image(ImageContent {
            bytes: vec![0u8; 1024],
            width: 8,
            height: 8,
            format: ImageFormat::Png,
            thumbnail: None,
        });
        let kept = image.clone().enforce_size_caps().unwrap();
        assert_eq!(kept, image);
    }
}
