//! Snapshot body encoding
//!
//! A body is the canonical JSON of a `PersistedState`, gzip-compressed when
//! compression is enabled and the body reaches the configured threshold.
//! The checksum is always the hex SHA-256 of the canonical, uncompressed
//! bytes, so the same state hashes identically whether or not it was
//! compressed.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{PersistError, PersistResult};
use crate::types::{PersistedState, SnapshotMetadata};
use crate::utils::canonical_json_bytes;

/// An encoded snapshot body with its integrity data
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub body: Vec<u8>,
    pub checksum: String,
    pub compressed: bool,
}

/// Hex SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize, checksum and optionally compress a state
pub fn encode_state(
    state: &PersistedState,
    compress: bool,
    compression_threshold: usize,
) -> PersistResult<EncodedSnapshot> {
    let canonical = canonical_json_bytes(&serde_json::to_value(state)?)?;
    let checksum = checksum(&canonical);

    if compress && canonical.len() >= compression_threshold {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&canonical)?;
        let body = encoder.finish()?;
        return Ok(EncodedSnapshot {
            body,
            checksum,
            compressed: true,
        });
    }

    Ok(EncodedSnapshot {
        body: canonical,
        checksum,
        compressed: false,
    })
}

/// Decompress and verify a body against its metadata, then parse it
///
/// A body that cannot be decompressed or whose checksum differs from the
/// metadata fails with `ChecksumMismatch`.
pub fn decode_state(metadata: &SnapshotMetadata, body: &[u8]) -> PersistResult<PersistedState> {
    let canonical = if metadata.compressed {
        let mut decoder = GzDecoder::new(body);
        let mut out = Vec::new();
        if let Err(e) = decoder.read_to_end(&mut out) {
            return Err(PersistError::ChecksumMismatch {
                snapshot_id: metadata.snapshot_id.clone(),
                expected: metadata.checksum.clone(),
                actual: format!("undecodable body ({})", e),
            });
        }
        out
    } else {
        body.to_vec()
    };

    let actual = checksum(&canonical);
    if actual != metadata.checksum {
        return Err(PersistError::ChecksumMismatch {
            snapshot_id: metadata.snapshot_id.clone(),
            expected: metadata.checksum.clone(),
            actual,
        });
    }

    Ok(serde_json::from_slice(&canonical)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateVersion;
    use chrono::Utc;
    use serde_json::json;

    fn state_with_payload(size: usize) -> PersistedState {
        let mut state = PersistedState::new("g1");
        state.current_state = "playing".to_string();
        state
            .state_data
            .insert("log".to_string(), json!("x".repeat(size)));
        state
    }

    fn metadata_for(encoded: &EncodedSnapshot) -> SnapshotMetadata {
        SnapshotMetadata {
            snapshot_id: "s1".to_string(),
            state_machine_id: "g1".to_string(),
            version: StateVersion::initial(),
            created_at: Utc::now(),
            size_bytes: encoded.body.len() as u64,
            compressed: encoded.compressed,
            checksum: encoded.checksum.clone(),
            transition_count: 0,
            tags: Vec::new(),
            ordinal: 0,
            sequence_number: None,
        }
    }

    #[test]
    fn test_small_bodies_stay_uncompressed() {
        let encoded = encode_state(&state_with_payload(10), true, 1024).unwrap();
        assert!(!encoded.compressed);

        let decoded = decode_state(&metadata_for(&encoded), &encoded.body).unwrap();
        assert_eq!(decoded.get("log"), Some(&json!("x".repeat(10))));
    }

    #[test]
    fn test_checksum_independent_of_compression() {
        let state = state_with_payload(4096);
        let plain = encode_state(&state, false, 0).unwrap();
        let packed = encode_state(&state, true, 0).unwrap();

        assert!(packed.compressed);
        assert!(packed.body.len() < plain.body.len());
        assert_eq!(plain.checksum, packed.checksum);
        assert_eq!(decode_state(&metadata_for(&packed), &packed.body).unwrap(), state);
    }

    #[test]
    fn test_corrupted_body_is_checksum_mismatch() {
        for compress in [false, true] {
            let encoded = encode_state(&state_with_payload(2048), compress, 0).unwrap();
            let meta = metadata_for(&encoded);
            let mut body = encoded.body.clone();
            let middle = body.len() / 2;
            body[middle] ^= 0xFF;

            assert!(matches!(
                decode_state(&meta, &body),
                Err(PersistError::ChecksumMismatch { .. })
            ));
        }
    }
}
