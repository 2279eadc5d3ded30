//! On-disk record encoding: bincode, then LZ4 with a size prefix.
//!
//! Document content is free text and compresses well, so every value
//! written to RocksDB goes through the same two steps.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Encode a value for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Decode a stored value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(value)
}
