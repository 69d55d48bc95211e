//! Base64 helpers shared across the wire schema and persisted state
//!
//! Peers on other platforms emit base64 both with and without padding, so
//! every decode path in the crate goes through [`decode_base64_tolerant`].

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};
use serde::{Deserialize, Deserializer, Serializer};

use crate::{Error, Result};

/// Encode without padding, the canonical form for `data_base64` fields
pub fn encode_base64_no_pad(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

/// Encode with standard padding
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode base64 regardless of whether the input carries `=` padding
pub fn decode_base64_tolerant(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::PayloadMalformed(format!("invalid base64: {}", e)))
}

/// Serialize/deserialize a `Vec<u8>` as a base64 string.
///
/// Usage:
/// ```ignore
/// #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
/// pub field: Vec<u8>,
/// ```
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(data: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        decode_base64_tolerant(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize/deserialize a `[u8; 32]` array as a base64 string.
/// Used for keys and hashes.
pub mod base64_array_32 {
    use super::*;

    pub fn serialize<S>(data: &[u8; 32], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = decode_base64_tolerant(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid length: expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestVec {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_base64_bytes_roundtrip() {
        let original = TestVec {
            data: vec![1, 2, 3, 4, 5],
        };
        let json = serde_json::to_string(&original).unwrap();
        let decoded: TestVec = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_tolerant_decode_with_padding() {
        // "hi" encodes to "aGk=" padded, "aGk" unpadded
        assert_eq!(decode_base64_tolerant("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64_tolerant("aGk").unwrap(), b"hi");
    }

    #[test]
    fn test_tolerant_decode_rejects_garbage() {
        assert!(decode_base64_tolerant("not base64!!!").is_err());
    }

    #[test]
    fn test_no_pad_encoding_has_no_padding() {
        let encoded = encode_base64_no_pad(b"hi");
        assert_eq!(encoded, "aGk");
        assert!(!encoded.contains('='));
    }
}
