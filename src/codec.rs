//! # Blob Codec for the `yap` Table
//!
//! The `yap` table stores engine metadata as opaque blobs keyed by strings.
//! Two values matter to the engine itself:
//!
//! | Key | Encoding |
//! |---|---|
//! | `"user_version"` | i32, 4-byte little-endian |
//! | `"lastWriteTimestamp"` | f64, 8-byte little-endian |
//!
//! Fixed-width little-endian keeps the format trivial to inspect with any
//! hex dump and identical across platforms. A blob of the wrong width is a
//! corruption signal, not a parse error: nothing but this engine writes
//! those rows.

use crate::error::{Error, Result};
use crate::types::WriteTimestamp;

/// Key of the schema-revision row in the `yap` table.
pub const USER_VERSION_KEY: &str = "user_version";

/// Key of the snapshot-timestamp row in the `yap` table.
pub const LAST_WRITE_TIMESTAMP_KEY: &str = "lastWriteTimestamp";

// =============================================================================
// Timestamp Encoding
// =============================================================================

/// Encodes a write timestamp as an 8-byte little-endian blob.
pub fn encode_timestamp(ts: WriteTimestamp) -> Vec<u8> {
    ts.as_raw().to_le_bytes().to_vec()
}

/// Decodes a write timestamp from its blob form.
///
/// # Errors
///
/// [`Error::Corrupt`] if the blob is not exactly 8 bytes.
pub fn decode_timestamp(blob: &[u8]) -> Result<WriteTimestamp> {
    let bytes: [u8; 8] = blob.try_into().map_err(|_| {
        Error::Corrupt(format!(
            "lastWriteTimestamp blob has {} bytes, expected 8",
            blob.len()
        ))
    })?;
    Ok(WriteTimestamp::from_raw(f64::from_le_bytes(bytes)))
}

// =============================================================================
// Version Encoding
// =============================================================================

/// Encodes a schema revision as a 4-byte little-endian blob.
pub fn encode_version(version: i32) -> Vec<u8> {
    version.to_le_bytes().to_vec()
}

/// Decodes a schema revision from its blob form.
///
/// # Errors
///
/// [`Error::Corrupt`] if the blob is not exactly 4 bytes.
pub fn decode_version(blob: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = blob.try_into().map_err(|_| {
        Error::Corrupt(format!(
            "user_version blob has {} bytes, expected 4",
            blob.len()
        ))
    })?;
    Ok(i32::from_le_bytes(bytes))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        for raw in [0.0, 1.5, 12345.678901, f64::MIN_POSITIVE] {
            let ts = WriteTimestamp::from_raw(raw);
            let blob = encode_timestamp(ts);
            assert_eq!(blob.len(), 8);
            assert_eq!(decode_timestamp(&blob).unwrap().as_raw(), raw);
        }
    }

    #[test]
    fn test_version_round_trip() {
        for v in [0, 1, 42, i32::MAX] {
            let blob = encode_version(v);
            assert_eq!(blob.len(), 4);
            assert_eq!(decode_version(&blob).unwrap(), v);
        }
    }

    /// Wrong-width blobs are corruption, not parse failures.
    #[test]
    fn test_short_blobs_are_corrupt() {
        assert!(matches!(
            decode_timestamp(&[0u8; 7]),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(decode_version(&[0u8; 3]), Err(Error::Corrupt(_))));
        assert!(matches!(decode_version(&[0u8; 8]), Err(Error::Corrupt(_))));
    }
}
