//! Codec (C1): marshal/parse for the header and every row kind, plus the
//! discriminated [`parse_row`] entry point that dispatches on the
//! `(start_control, end_control)` pair.
//!
//! Row layout (`R` = `row_size`, all fixed-width):
//! ```text
//! [ROW_START:1][start_control:1][end_control:2][payload:R-7][parity:2][ROW_END:1]
//! ```
//! Parity covers every byte from offset 0 through `R-4` inclusive, i.e.
//! everything except the two parity bytes and the trailing sentinel.

use crate::error::{Error, Result};
use crate::uuid7;

pub const ROW_START: u8 = 0x02;
pub const ROW_END: u8 = 0x0A;
pub const MAGIC: [u8; 4] = *b"FZDB";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 64;
const HEADER_PARITY_COVERED: usize = 62;
/// ROW_START + start_control + end_control + parity + ROW_END.
const ROW_FIXED_OVERHEAD: usize = 1 + 1 + 2 + 2 + 1;

/// Uppercase-hex XOR parity over `data`, per §3.4.
fn parity_hex(data: &[u8]) -> [u8; 2] {
    let xor = data.iter().fold(0u8, |acc, b| acc ^ b);
    let hex = format!("{xor:02X}");
    let bytes = hex.as_bytes();
    [bytes[0], bytes[1]]
}

/// The 64-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub row_size: u32,
    pub skew_ms: u32,
}

impl Header {
    pub fn marshal(&self) -> Result<[u8; HEADER_LEN]> {
        crate::config::CreateConfig::new("x.fdb", self.row_size, self.skew_ms).validate()?;
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5..9].copy_from_slice(&self.row_size.to_be_bytes());
        buf[9..13].copy_from_slice(&self.skew_ms.to_be_bytes());
        // buf[13..62] stays zero padding.
        let parity = parity_hex(&buf[0..HEADER_PARITY_COVERED]);
        buf[62..64].copy_from_slice(&parity);
        Ok(buf)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(Error::corrupt(format!(
                "header must be {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(Error::corrupt("bad header magic"));
        }
        if bytes[4] != VERSION {
            return Err(Error::corrupt(format!(
                "unsupported header version {}",
                bytes[4]
            )));
        }
        let expected_parity = parity_hex(&bytes[0..HEADER_PARITY_COVERED]);
        if bytes[62..64] != expected_parity {
            return Err(Error::corrupt("header parity mismatch"));
        }
        let row_size = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        let skew_ms = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
        let header = Self { row_size, skew_ms };
        crate::config::CreateConfig::new("x.fdb", row_size, skew_ms)
            .validate()
            .map_err(|e| Error::corrupt(format!("header field out of range: {e}")))?;
        Ok(header)
    }
}

/// `start_control` byte, closed alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartControl {
    Transaction,
    Continue,
    Checksum,
}

impl StartControl {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Transaction => b'T',
            Self::Continue => b'R',
            Self::Checksum => b'C',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'T' => Ok(Self::Transaction),
            b'R' => Ok(Self::Continue),
            b'C' => Ok(Self::Checksum),
            other => Err(Error::corrupt(format!(
                "unknown start_control byte {other:#04x}"
            ))),
        }
    }
}

/// `end_control` 2-byte field, closed alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    TransactionCommit,
    SavepointCommit,
    SavepointContinue,
    RowEnd,
    ChecksumMarker,
    FullRollback,
    /// `R1`-`R9`: rollback to savepoint n.
    RollbackToSavepoint(u8),
    /// `S0`-`S9`: rollback-to-savepoint marker.
    SavepointMarker(u8),
}

impl EndControl {
    const fn to_bytes(self) -> [u8; 2] {
        match self {
            Self::TransactionCommit => *b"TC",
            Self::SavepointCommit => *b"SC",
            Self::SavepointContinue => *b"SE",
            Self::RowEnd => *b"RE",
            Self::ChecksumMarker => *b"CS",
            Self::FullRollback => *b"R0",
            Self::RollbackToSavepoint(n) => [b'R', b'0' + n],
            Self::SavepointMarker(n) => [b'S', b'0' + n],
        }
    }

    fn from_bytes(b: [u8; 2]) -> Result<Self> {
        match b {
            [b'T', b'C'] => Ok(Self::TransactionCommit),
            [b'S', b'C'] => Ok(Self::SavepointCommit),
            [b'S', b'E'] => Ok(Self::SavepointContinue),
            [b'R', b'E'] => Ok(Self::RowEnd),
            [b'C', b'S'] => Ok(Self::ChecksumMarker),
            [b'R', b'0'] => Ok(Self::FullRollback),
            [b'R', d @ b'1'..=b'9'] => Ok(Self::RollbackToSavepoint(d - b'0')),
            [b'S', d @ b'0'..=b'9'] => Ok(Self::SavepointMarker(d - b'0')),
            other => Err(Error::corrupt(format!(
                "unknown end_control bytes {:?}",
                std::str::from_utf8(&other)
            ))),
        }
    }

    /// Rows whose `end_control` is transaction-terminal end the
    /// transaction they belong to (I5).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TransactionCommit
                | Self::SavepointCommit
                | Self::FullRollback
                | Self::RollbackToSavepoint(_)
                | Self::SavepointMarker(_)
        )
    }
}

/// A data-carrying row: `start` ∈ {T, R}.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub start: StartControl,
    pub end: EndControl,
    pub key: [u8; 16],
    pub value: serde_json::Value,
}

/// A DataRow-shaped row marking an empty commit or a rollback; carries a
/// real UUIDv7 timestamp but an all-zero-otherwise key (see
/// [`uuid7::null_key_for_timestamp`]).
#[derive(Debug, Clone, PartialEq)]
pub struct NullRow {
    pub start: StartControl,
    pub end: EndControl,
    pub timestamp_ms: u64,
}

/// One block-boundary checksum row: `start=C`, `end=CS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc: u32,
}

/// A consistent prefix (< `row_size` bytes) of a row still being written.
/// Has no parity check; legal only as the final bytes of the file (I6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDataRow {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowUnion {
    Data(DataRow),
    Null(NullRow),
    Checksum(ChecksumRow),
    Partial(PartialDataRow),
}

impl RowUnion {
    #[must_use]
    pub const fn end_control(&self) -> Option<EndControl> {
        match self {
            Self::Data(r) => Some(r.end),
            Self::Null(r) => Some(r.end),
            Self::Checksum(_) | Self::Partial(_) => None,
        }
    }

    #[must_use]
    pub const fn start_control(&self) -> Option<StartControl> {
        match self {
            Self::Data(r) => Some(r.start),
            Self::Null(r) => Some(r.start),
            Self::Checksum(_) | Self::Partial(_) => None,
        }
    }

    #[must_use]
    pub const fn is_checksum(&self) -> bool {
        matches!(self, Self::Checksum(_))
    }
}

fn payload_len(row_size: u32) -> Result<usize> {
    (row_size as usize)
        .checked_sub(ROW_FIXED_OVERHEAD)
        .ok_or_else(|| Error::invalid_input("row_size too small to hold any payload"))
}

/// Bytes available to a key+value pair in one row, i.e. `payload_len`
/// minus nothing further: the whole payload region is key+value.
/// Exposed so callers (the transaction engine) can reject an oversized
/// `add_row` before attempting to marshal it.
pub fn payload_capacity(row_size: u32) -> Result<usize> {
    payload_len(row_size)
}

/// Writes `key` (16 bytes) + `value` JSON, left-aligned and right-padded
/// with 0x20, into a payload region of `payload_len` bytes.
fn marshal_keyed_payload(key: &[u8; 16], value_bytes: &[u8], payload_len: usize) -> Result<Vec<u8>> {
    let used = 16 + value_bytes.len();
    if used > payload_len {
        return Err(Error::invalid_input(format!(
            "row payload overflow: key+value is {used} bytes, row holds {payload_len}"
        )));
    }
    let mut buf = vec![0x20u8; payload_len];
    buf[0..16].copy_from_slice(key);
    buf[16..16 + value_bytes.len()].copy_from_slice(value_bytes);
    Ok(buf)
}

fn strip_padding(region: &[u8]) -> &[u8] {
    let end = region
        .iter()
        .rposition(|&b| b != 0x20)
        .map_or(0, |i| i + 1);
    &region[0..end]
}

fn marshal_generic(
    row_size: u32,
    start: StartControl,
    end: EndControl,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let plen = payload_len(row_size)?;
    if payload.len() != plen {
        return Err(Error::invalid_input("payload length does not match row_size"));
    }
    let mut buf = Vec::with_capacity(row_size as usize);
    buf.push(ROW_START);
    buf.push(start.to_byte());
    buf.extend_from_slice(&end.to_bytes());
    buf.extend_from_slice(payload);
    let parity = parity_hex(&buf);
    buf.extend_from_slice(&parity);
    buf.push(ROW_END);
    debug_assert_eq!(buf.len(), row_size as usize);
    Ok(buf)
}

pub fn marshal_data_row(row: &DataRow, row_size: u32) -> Result<Vec<u8>> {
    uuid7::validate(&row.key)?;
    if uuid7::is_null_shaped(&row.key) {
        return Err(Error::invalid_input(
            "key is NullRow-shaped and would be ambiguous with a NullRow on parse",
        ));
    }
    let value_bytes = serde_json::to_vec(&row.value)
        .map_err(|e| Error::invalid_input(format!("value does not marshal to JSON: {e}")))?;
    let payload = marshal_keyed_payload(&row.key, &value_bytes, payload_len(row_size)?)?;
    marshal_generic(row_size, row.start, row.end, &payload)
}

pub fn marshal_null_row(row: &NullRow, row_size: u32) -> Result<Vec<u8>> {
    let key = uuid7::null_key_for_timestamp(row.timestamp_ms);
    let payload = marshal_keyed_payload(&key, &[], payload_len(row_size)?)?;
    marshal_generic(row_size, row.start, row.end, &payload)
}

pub fn marshal_checksum_row(row: ChecksumRow, row_size: u32) -> Result<Vec<u8>> {
    let plen = payload_len(row_size)?;
    let encoded = crate::checksum::serialize(row.crc);
    if encoded.len() > plen {
        return Err(Error::invalid_input("row_size too small to hold a checksum payload"));
    }
    let mut payload = vec![0x20u8; plen];
    payload[0..encoded.len()].copy_from_slice(&encoded);
    marshal_generic(row_size, StartControl::Checksum, EndControl::ChecksumMarker, &payload)
}

/// Dispatches on `(start_control, end_control)` per the closed alphabet.
/// `bytes` shorter than `row_size` parse as [`RowUnion::Partial`].
pub fn parse_row(bytes: &[u8], row_size: u32) -> Result<RowUnion> {
    let row_size = row_size as usize;
    if bytes.len() > row_size {
        return Err(Error::invalid_input("more bytes than one row_size given to parse_row"));
    }
    if bytes.len() < row_size {
        return Ok(RowUnion::Partial(PartialDataRow {
            bytes: bytes.to_vec(),
        }));
    }

    if bytes[0] != ROW_START {
        return Err(Error::corrupt(format!(
            "bad ROW_START sentinel {:#04x}",
            bytes[0]
        )));
    }
    if bytes[row_size - 1] != ROW_END {
        return Err(Error::corrupt(format!(
            "bad ROW_END sentinel {:#04x}",
            bytes[row_size - 1]
        )));
    }
    let covered = row_size - 3;
    let expected_parity = parity_hex(&bytes[0..covered]);
    if bytes[covered..covered + 2] != expected_parity {
        return Err(Error::corrupt("row parity mismatch"));
    }

    let start = StartControl::from_byte(bytes[1])?;
    let end = EndControl::from_bytes([bytes[2], bytes[3]]);

    let plen = payload_len(row_size as u32)?;
    let payload = &bytes[4..4 + plen];

    if start == StartControl::Checksum {
        let end = end?;
        if end != EndControl::ChecksumMarker {
            return Err(Error::corrupt("checksum row with non-CS end_control"));
        }
        let trimmed = strip_padding(payload);
        let crc = crate::checksum::deserialize(trimmed)?;
        return Ok(RowUnion::Checksum(ChecksumRow { crc }));
    }
    let end = end?;
    if end == EndControl::ChecksumMarker {
        return Err(Error::corrupt("non-checksum row carries CS end_control"));
    }

    let key: [u8; 16] = payload[0..16]
        .try_into()
        .map_err(|_| Error::corrupt("row payload too short for a key"))?;
    uuid7::validate(&key)?;

    if uuid7::is_null_shaped(&key) {
        if !matches!(end, EndControl::TransactionCommit | EndControl::FullRollback)
            && !matches!(end, EndControl::SavepointMarker(_))
        {
            return Err(Error::corrupt(
                "NullRow-shaped key with an end_control that is not a valid NullRow terminator",
            ));
        }
        let value_region = strip_padding(&payload[16..]);
        if !value_region.is_empty() {
            return Err(Error::corrupt("NullRow value region is not all padding"));
        }
        let timestamp_ms = uuid7::extract_timestamp_ms(&key);
        return Ok(RowUnion::Null(NullRow {
            start,
            end,
            timestamp_ms,
        }));
    }

    let value_bytes = strip_padding(&payload[16..]);
    let value: serde_json::Value = serde_json::from_slice(value_bytes)
        .map_err(|e| Error::corrupt(format!("row value is not valid JSON: {e}")))?;
    Ok(RowUnion::Data(DataRow {
        start,
        end,
        key,
        value,
    }))
}
