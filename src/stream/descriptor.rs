//! Stream descriptors
//!
//! An SD blob is plaintext JSON listing the content blobs of a stream: an
//! AES key, and one blob info per chunk carrying the blob hash, the IV used
//! to encrypt it, and its on-the-wire length. The final blob info is a
//! terminator with length 0 and no hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::error::{PlayerError, Result};

/// Maximum size of a single blob on the wire (2 MiB)
pub const MAX_BLOB_SIZE: usize = 2 * 1024 * 1024;

/// Maximum plaintext size of a decrypted chunk (one CBC block of padding
/// is always present on a full blob)
pub const MAX_CHUNK_SIZE: usize = MAX_BLOB_SIZE - 16;

/// Length of a blob hash in hex characters (SHA-384)
pub const BLOB_HASH_HEX_LEN: usize = 96;

/// Compute the content address of a blob: lowercase SHA-384 hex.
pub fn blob_hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether a string is a well-formed blob hash (96 lowercase hex chars).
pub fn is_valid_blob_hash(s: &str) -> bool {
    s.len() == BLOB_HASH_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// One entry in a stream descriptor's blob list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub blob_num: usize,
    /// Absent on the terminator entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_hash: Option<String>,
    /// Hex-encoded 16-byte CBC initialization vector
    pub iv: String,
    /// Ciphertext length on the wire; 0 on the terminator
    #[serde(default)]
    pub length: usize,
}

impl BlobInfo {
    pub fn is_terminator(&self) -> bool {
        self.length == 0 && self.blob_hash.is_none()
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>> {
        let iv = hex::decode(&self.iv)
            .map_err(|e| PlayerError::Descriptor(format!("bad iv hex: {e}")))?;
        if iv.len() != 16 {
            return Err(PlayerError::Descriptor(format!(
                "iv must be 16 bytes, got {}",
                iv.len()
            )));
        }
        Ok(iv)
    }
}

/// Parsed SD blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    #[serde(default)]
    pub stream_name: String,
    /// Hex-encoded AES key for every content blob of the stream
    pub key: String,
    #[serde(default)]
    pub stream_type: String,
    pub blobs: Vec<BlobInfo>,
    #[serde(default)]
    pub stream_hash: String,
    /// Hex-encoded suggested filename carried from authoring
    #[serde(default)]
    pub suggested_file_name: String,
}

impl StreamDescriptor {
    /// Parse and validate an SD blob.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let descriptor: StreamDescriptor = serde_json::from_slice(raw)
            .map_err(|e| PlayerError::Descriptor(format!("bad SD blob json: {e}")))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Enforce the descriptor invariants: a contiguous blob list starting at
    /// 0, every content blob carrying a well-formed hash and IV, and exactly
    /// one terminator at the end.
    pub fn validate(&self) -> Result<()> {
        if self.blobs.is_empty() {
            return Err(PlayerError::Descriptor("empty blob list".into()));
        }

        let last = self.blobs.len() - 1;
        for (i, blob) in self.blobs.iter().enumerate() {
            if blob.blob_num != i {
                return Err(PlayerError::Descriptor(format!(
                    "blob numbers not contiguous: expected {i}, got {}",
                    blob.blob_num
                )));
            }
            blob.iv_bytes()?;
            if i == last {
                if !blob.is_terminator() {
                    return Err(PlayerError::Descriptor(
                        "last blob info is not a terminator".into(),
                    ));
                }
            } else {
                let hash = blob.blob_hash.as_deref().ok_or_else(|| {
                    PlayerError::Descriptor(format!("content blob {i} has no hash"))
                })?;
                if !is_valid_blob_hash(hash) {
                    return Err(PlayerError::Descriptor(format!(
                        "content blob {i} has malformed hash"
                    )));
                }
                if blob.length == 0 || blob.length > MAX_BLOB_SIZE {
                    return Err(PlayerError::Descriptor(format!(
                        "content blob {i} has invalid length {}",
                        blob.length
                    )));
                }
            }
        }

        self.key_bytes()?;
        Ok(())
    }

    /// Decode the stream key. Length selects the cipher downstream
    /// (16 bytes for AES-128-CBC, 32 for AES-256-CBC).
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        let key = hex::decode(&self.key)
            .map_err(|e| PlayerError::Descriptor(format!("bad key hex: {e}")))?;
        match key.len() {
            16 | 32 => Ok(key),
            n => Err(PlayerError::Descriptor(format!(
                "unsupported key length {n}"
            ))),
        }
    }

    /// Number of content blobs (the terminator excluded).
    pub fn chunk_count(&self) -> usize {
        self.blobs.len().saturating_sub(1)
    }

    /// Blob info for content chunk `index`, failing on the terminator and
    /// anything past it.
    pub fn content_blob(&self, index: usize) -> Result<&BlobInfo> {
        if index >= self.chunk_count() {
            return Err(PlayerError::OutOfBounds);
        }
        Ok(&self.blobs[index])
    }

    /// Suggested filename decoded from its hex form, when decodable.
    pub fn suggested_file_name(&self) -> Option<String> {
        let raw = hex::decode(&self.suggested_file_name).ok()?;
        let name = String::from_utf8(raw).ok()?;
        (!name.is_empty()).then_some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_hash(seed: u8) -> String {
        blob_hash_hex(&[seed])
    }

    fn descriptor_json(lengths: &[usize]) -> Vec<u8> {
        let mut blobs = Vec::new();
        for (i, len) in lengths.iter().enumerate() {
            blobs.push(serde_json::json!({
                "blob_num": i,
                "blob_hash": test_hash(i as u8),
                "iv": hex::encode([i as u8; 16]),
                "length": len,
            }));
        }
        blobs.push(serde_json::json!({
            "blob_num": lengths.len(),
            "iv": hex::encode([0xffu8; 16]),
            "length": 0,
        }));
        serde_json::to_vec(&serde_json::json!({
            "stream_name": hex::encode(b"test stream"),
            "key": hex::encode([0u8; 32]),
            "stream_type": "lbryfile",
            "blobs": blobs,
            "suggested_file_name": hex::encode(b"movie.mp4"),
        }))
        .unwrap()
    }

    #[test]
    fn hashes_are_sha384_hex() {
        let h = blob_hash_hex(b"hello");
        assert_eq!(h.len(), BLOB_HASH_HEX_LEN);
        assert!(is_valid_blob_hash(&h));
        assert!(!is_valid_blob_hash("abc123"));
        assert!(!is_valid_blob_hash(&h.to_uppercase()));
    }

    #[test]
    fn parses_a_valid_descriptor() {
        let sd = StreamDescriptor::from_json(&descriptor_json(&[MAX_BLOB_SIZE, 5000])).unwrap();
        assert_eq!(sd.chunk_count(), 2);
        assert_eq!(sd.key_bytes().unwrap().len(), 32);
        assert_eq!(sd.suggested_file_name().as_deref(), Some("movie.mp4"));
        assert!(sd.blobs.last().unwrap().is_terminator());
    }

    #[test]
    fn terminator_only_stream_has_zero_chunks() {
        let sd = StreamDescriptor::from_json(&descriptor_json(&[])).unwrap();
        assert_eq!(sd.chunk_count(), 0);
        assert!(matches!(
            sd.content_blob(0),
            Err(PlayerError::OutOfBounds)
        ));
    }

    #[test]
    fn rejects_gap_in_blob_numbers() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&descriptor_json(&[1000])).unwrap();
        value["blobs"][1]["blob_num"] = serde_json::json!(5);
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            StreamDescriptor::from_json(&raw),
            Err(PlayerError::Descriptor(_))
        ));
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&descriptor_json(&[1000])).unwrap();
        value["blobs"][1]["length"] = serde_json::json!(42);
        value["blobs"][1]["blob_hash"] = serde_json::json!(test_hash(9));
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            StreamDescriptor::from_json(&raw),
            Err(PlayerError::Descriptor(_))
        ));
    }

    #[test]
    fn rejects_unsupported_key_length() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&descriptor_json(&[1000])).unwrap();
        value["key"] = serde_json::json!(hex::encode([0u8; 20]));
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            StreamDescriptor::from_json(&raw),
            Err(PlayerError::Descriptor(_))
        ));
    }
}
