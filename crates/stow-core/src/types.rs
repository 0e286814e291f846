//! Descriptor types exchanged between the uploader and the eventual reader.

use serde::{Deserialize, Serialize};

/// Length of the per-asset symmetric key and of the ed25519 verify key.
pub const ASSET_KEY_SIZE: usize = 32;

/// Where an asset lives in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub bucket: String,
    pub object_key: String,
}

impl Destination {
    pub fn new(bucket: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object_key)
    }
}

/// Metadata about the local plaintext being uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSource {
    pub filename: String,
    /// Plaintext length in bytes
    pub size: u64,
}

/// Durable descriptor of an uploaded asset.
///
/// This is the only artifact a reader needs (besides storage access) to fetch
/// and verify the plaintext. Keys are serialized as standard base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub object_key: String,
    /// Sealed (ciphertext) length in bytes
    pub size: u64,
    #[serde(with = "b64_key")]
    pub encrypt_key: [u8; ASSET_KEY_SIZE],
    #[serde(with = "b64_key")]
    pub verify_key: [u8; ASSET_KEY_SIZE],
}

impl Asset {
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| anyhow::anyhow!("asset serialization: {e}"))
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        serde_json::from_str(data).map_err(|e| anyhow::anyhow!("asset deserialization: {e}"))
    }
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("object_key", &self.object_key)
            .field("size", &self.size)
            .field("encrypt_key", &"[REDACTED]")
            .field("verify_key", &base64_encode(&self.verify_key))
            .finish()
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

mod b64_key {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::ASSET_KEY_SIZE;

    pub fn serialize<S: Serializer>(key: &[u8; ASSET_KEY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ASSET_KEY_SIZE], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 key: {e}")))?;
        bytes.as_slice().try_into().map_err(|_| {
            D::Error::custom(format!(
                "key has wrong size: {} bytes (expected {ASSET_KEY_SIZE})",
                bytes.len()
            ))
        })
    }
}
