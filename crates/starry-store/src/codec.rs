//! Whole-document encoding.
//!
//! On-disk (and in-cache) format:
//! ```text
//! [N bytes: bincode-serialized Value]
//! [4 bytes: CRC32 of the payload (little-endian u32)]
//! ```

use starry_types::Value;

use crate::error::{StoreError, StoreResult};

/// Extension of primary and backup document files.
pub const EXTENSION: &str = "blob";

/// Extension of the transient sibling written during a copy.
pub const TMP_EXTENSION: &str = "blob.tmp";

const CHECKSUM_SIZE: usize = 4;

/// File name holding `key`.
pub fn file_name(key: &str) -> String {
    format!("{key}.{EXTENSION}")
}

/// Encode a document.
pub fn pack(value: &Value) -> StoreResult<Vec<u8>> {
    let mut buf =
        bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode a document, rejecting truncated or altered bytes.
pub fn unpack(data: &[u8]) -> StoreResult<Value> {
    if data.len() < CHECKSUM_SIZE {
        return Err(StoreError::Deserialization(format!(
            "document too short: {} bytes",
            data.len()
        )));
    }
    let (payload, trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(StoreError::Deserialization(format!(
            "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }
    bincode::deserialize(payload).map_err(|e| StoreError::Deserialization(e.to_string()))
}
