//! Checksum engine (C2): CRC32-IEEE over header-initial and every
//! subsequent 10 000-row block, serialized as 8 characters of standard
//! Base64 for embedding in a [`crate::codec::ChecksumRow`] payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Number of data/null rows covered by one block, between ChecksumRows.
pub const BLOCK_ROWS: u64 = 10_000;
/// Physical row stride between ChecksumRows (one checksum row + its block).
pub const CHECKSUM_STRIDE: u64 = BLOCK_ROWS + 1;

/// CRC32-IEEE over `bytes`. Stateless and idempotent.
#[must_use]
pub fn compute(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// 8-character standard Base64 (with `==` padding) of the big-endian
/// 4-byte CRC32.
#[must_use]
pub fn serialize(crc: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    let encoded = STANDARD.encode(crc.to_be_bytes());
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Inverse of [`serialize`]; rejects malformed Base64 or wrong length.
pub fn deserialize(payload: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::corrupt("checksum row payload is not valid UTF-8"))?;
    let decoded = STANDARD
        .decode(text)
        .map_err(|e| Error::corrupt(format!("checksum row payload is not valid base64: {e}")))?;
    let bytes: [u8; 4] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| Error::corrupt("checksum row payload does not decode to 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// An incremental CRC32-IEEE accumulator used by the transaction engine
/// to fold in each row's raw bytes as it is written, so that a block's
/// checksum never requires re-reading bytes back from disk.
#[derive(Default)]
pub struct RollingChecksum {
    hasher: crc32fast::Hasher,
}

impl RollingChecksum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    #[must_use]
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// Number of ChecksumRows present among `total_physical` physical rows
/// (including the initial one at physical index 0).
#[must_use]
pub const fn num_checksum_rows(total_physical: u64) -> u64 {
    if total_physical == 0 {
        0
    } else {
        (total_physical - 1) / CHECKSUM_STRIDE + 1
    }
}

/// Number of logical (data/null) rows among `total_physical` physical rows.
#[must_use]
pub const fn num_logical_rows(total_physical: u64) -> u64 {
    total_physical - num_checksum_rows(total_physical)
}

/// Maps a logical row index to its physical offset within the row stream.
#[must_use]
pub const fn physical_of_logical(logical: u64) -> u64 {
    logical + logical / BLOCK_ROWS + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        let data = b"frozendb";
        assert_eq!(compute(data), compute(data));
        assert_ne!(compute(data), compute(b"frozendc"));
    }

    #[test]
    fn serialize_roundtrips() {
        let crc = compute(b"hello world");
        let encoded = serialize(crc);
        assert_eq!(encoded.len(), 8);
        assert_eq!(deserialize(&encoded).unwrap(), crc);
    }

    #[test]
    fn rolling_matches_one_shot() {
        let mut rolling = RollingChecksum::new();
        rolling.update(b"hello, ");
        rolling.update(b"world!");
        assert_eq!(rolling.finalize(), compute(b"hello, world!"));
    }

    #[test]
    fn physical_logical_mapping_matches_spec_example() {
        assert_eq!(physical_of_logical(0), 1);
        assert_eq!(physical_of_logical(9999), 10000);
        assert_eq!(physical_of_logical(10000), 10002);
        assert_eq!(num_checksum_rows(1), 1);
        assert_eq!(num_checksum_rows(10001), 1);
        assert_eq!(num_checksum_rows(10002), 2);
        assert_eq!(num_logical_rows(10002), 10000);
    }
}
