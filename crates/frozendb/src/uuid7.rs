//! UUIDv7 helpers: timestamp extraction, validation, and the synthetic
//! all-zero-except-timestamp key used by [`crate::codec::NullRow`].

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 16;

/// Pulls the 48-bit millisecond timestamp out of a UUIDv7's leading 6 bytes.
#[must_use]
pub fn extract_timestamp_ms(key: &[u8; KEY_LEN]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..8].copy_from_slice(&key[0..6]);
    u64::from_be_bytes(buf)
}

/// `ValidateUUIDv7`: version nibble must be 7, variant bits must be `10`.
pub fn validate(key: &[u8; KEY_LEN]) -> Result<()> {
    let version = key[6] >> 4;
    let variant = key[8] >> 6;
    if version != 0x7 {
        return Err(Error::invalid_input(format!(
            "key is not UUIDv7: version nibble {version:#x}, want 0x7"
        )));
    }
    if variant != 0b10 {
        return Err(Error::invalid_input(format!(
            "key is not UUIDv7: variant bits {variant:#04b}, want 0b10"
        )));
    }
    Ok(())
}

/// A search/stored key is "NullRow-shaped" when every non-timestamp,
/// non-version/variant byte is zero: bytes 7 and 9..16. Bytes 6 and 8
/// are excluded because they carry the UUIDv7 version nibble and variant
/// bits respectively, which are never zero on a real UUIDv7.
#[must_use]
pub fn is_null_shaped(key: &[u8; KEY_LEN]) -> bool {
    key[7] == 0 && key[9..16].iter().all(|&b| b == 0)
}

/// Builds the synthetic key used by a [`crate::codec::NullRow`]: real
/// UUIDv7 timestamp and version/variant markers, all other bits zero.
#[must_use]
pub fn null_key_for_timestamp(ts_ms: u64) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let ts_bytes = ts_ms.to_be_bytes();
    key[0..6].copy_from_slice(&ts_bytes[2..8]);
    key[6] = 0x70; // version nibble 7, random_a = 0
    key[8] = 0x80; // variant bits 10, random_b = 0
    key
}

/// Generates a fresh UUIDv7 for the given key/value pair's key field, used
/// by callers that want the crate to mint timestamps rather than supply
/// their own. The wall-clock source is the host OS clock.
#[must_use]
pub fn generate_now() -> [u8; KEY_LEN] {
    *uuid::Uuid::now_v7().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_timestamp() {
        let uuid = uuid::Uuid::now_v7();
        let key = *uuid.as_bytes();
        let ts = extract_timestamp_ms(&key);
        assert!(ts > 0);
        assert!(validate(&key).is_ok());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut key = [0u8; 16];
        key[6] = 0x40; // version 4
        key[8] = 0x80;
        assert!(validate(&key).is_err());
    }

    #[test]
    fn rejects_wrong_variant() {
        let mut key = [0u8; 16];
        key[6] = 0x70;
        key[8] = 0x00; // variant 00
        assert!(validate(&key).is_err());
    }

    #[test]
    fn null_key_is_null_shaped_and_valid_uuidv7() {
        let key = null_key_for_timestamp(12345);
        assert!(is_null_shaped(&key));
        assert!(validate(&key).is_ok());
        assert_eq!(extract_timestamp_ms(&key), 12345);
    }

    #[test]
    fn real_key_is_not_null_shaped() {
        let key = generate_now();
        assert!(!is_null_shaped(&key));
    }
}
