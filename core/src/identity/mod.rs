//! Device identity: stable id, display name, and long-lived key material

mod keystore;

pub use keystore::{KeyStore, MasterKey};

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Canonical stable device identifier: a lowercase UUID string.
///
/// Every boundary normalizes through [`DeviceId::normalize`], which strips
/// legacy platform prefixes and lowercases, so two ids compare equal iff
/// they name the same device.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

/// Legacy id prefixes still emitted by old clients
const LEGACY_PREFIXES: &[&str] = &["android-", "macos-"];

impl DeviceId {
    /// Normalize a raw device id: trim, strip legacy prefixes, lowercase,
    /// and validate as a UUID.
    pub fn normalize(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let stripped = LEGACY_PREFIXES
            .iter()
            .find_map(|p| trimmed.strip_prefix(p))
            .unwrap_or(trimmed);

        let uuid = Uuid::parse_str(stripped)
            .map_err(|_| Error::InvalidMessage(format!("invalid device id: {}", raw)))?;

        // Uuid renders lowercase hyphenated
        Ok(Self(uuid.to_string()))
    }

    /// Generate a fresh v4 id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id bytes used as AAD on every sealed payload
    pub fn as_aad(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: String = Deserialize::deserialize(deserializer)?;
        DeviceId::normalize(&raw).map_err(serde::de::Error::custom)
    }
}

/// Persistent device identity, generated on first run and immutable after
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub device_name: String,
}

impl DeviceIdentity {
    /// Load the identity from `path`, or generate and persist a new one.
    ///
    /// The display name defaults to the OS hostname; an existing file always
    /// wins so the id stays stable across renames of the machine.
    pub fn load_or_create(path: &Path, name_override: Option<String>) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let mut identity: DeviceIdentity = serde_json::from_str(&data)?;
            if let Some(name) = name_override {
                identity.device_name = name;
            }
            return Ok(identity);
        }

        let device_name = name_override.unwrap_or_else(default_device_name);
        let identity = DeviceIdentity {
            device_id: DeviceId::generate(),
            device_name,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&identity)?;
        std::fs::write(path, json)?;
        tracing::info!(device_id = %identity.device_id, "generated new device identity");

        Ok(identity)
    }
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "hypo-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases() {
        let id = DeviceId::normalize("AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee");
    }

    #[test]
    fn test_normalize_strips_legacy_prefixes() {
        let android = DeviceId::normalize("android-AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE").unwrap();
        let macos = DeviceId::normalize("macos-aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee").unwrap();
        assert_eq!(android, macos);
    }

    #[test]
    fn test_normalize_rejects_non_uuid() {
        assert!(DeviceId::normalize("not-a-uuid").is_err());
        assert!(DeviceId::normalize("").is_err());
    }

    #[test]
    fn test_same_device_iff_same_uuid() {
        let a = DeviceId::normalize("AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE").unwrap();
        let b = DeviceId::normalize("aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee").unwrap();
        let c = DeviceId::generate();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_deserialize_normalizes() {
        let id: DeviceId =
            serde_json::from_str("\"macos-AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE\"").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee");
    }

    #[test]
    fn test_identity_persists_across_loads() {
        let dir = std::env::temp_dir().join(format!("hypo-test-{}", Uuid::new_v4()));
        let path = dir.join("identity.json");

        let first = DeviceIdentity::load_or_create(&path, Some("laptop".into())).unwrap();
        let second = DeviceIdentity::load_or_create(&path, None).unwrap();

        assert_eq!(first.device_id, second.device_id);
        std::fs::remove_dir_all(&dir).ok();
    }
}
