//! Verifier (C7): two offline passes over a whole file.
//!
//! Pass 1 recomputes every `ChecksumRow`'s CRC32 against the byte range
//! it covers. Pass 2 re-parses every row with the codec and confirms
//! `ChecksumRow`s occur at exactly the positions I4 predicts. Verify
//! never inspects transaction nesting, savepoint numbering, or
//! timestamp ordering — those are cross-row semantics, not structure.

use crate::checksum::{self, CHECKSUM_STRIDE};
use crate::codec::{self, Header, RowUnion};
use crate::error::{Error, Result};
use crate::file::FileManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub row_size: u32,
    pub rows_checked: u64,
    pub checksum_rows_checked: u64,
    pub ends_with_partial_row: bool,
}

/// Runs both passes against `file`, reading only bytes below its
/// current durable size. `file` need not be opened in write mode.
pub fn verify(file: &FileManager) -> Result<VerifyReport> {
    let header_bytes = file.read(0, codec::HEADER_LEN as u64)?;
    let header = Header::parse(&header_bytes)?;
    let row_size = u64::from(header.row_size);

    let total_len = file.size();
    if total_len < codec::HEADER_LEN as u64 + row_size {
        return Err(Error::corrupt("file shorter than header + one row"));
    }

    let body_len = total_len - codec::HEADER_LEN as u64;
    let complete_rows = body_len / row_size;
    let remainder = body_len % row_size;

    let checksum_rows_checked = verify_checksums(file, &header_bytes, row_size, complete_rows)?;
    verify_row_structure(file, header.row_size, complete_rows)?;

    if remainder > 0 {
        let offset = codec::HEADER_LEN as u64 + complete_rows * row_size;
        let tail = file.read(offset, remainder)?;
        match codec::parse_row(&tail, header.row_size)? {
            RowUnion::Partial(_) => {}
            other => {
                return Err(Error::corrupt(format!(
                    "trailing {remainder} bytes parsed as {other:?} instead of PartialDataRow"
                )))
            }
        }
    }

    Ok(VerifyReport {
        row_size: header.row_size,
        rows_checked: complete_rows,
        checksum_rows_checked,
        ends_with_partial_row: remainder > 0,
    })
}

/// Pass 1: walk ChecksumRows at physical `k * CHECKSUM_STRIDE`, stopping
/// once the next one would fall at or past `complete_rows`.
fn verify_checksums(
    file: &FileManager,
    header_bytes: &[u8],
    row_size: u64,
    complete_rows: u64,
) -> Result<u64> {
    let mut k = 0u64;
    let mut checked = 0u64;
    loop {
        let physical = k * CHECKSUM_STRIDE;
        if physical >= complete_rows {
            break;
        }
        let offset = codec::HEADER_LEN as u64 + physical * row_size;
        let row_bytes = file.read(offset, row_size)?;
        let row_size_u32 = u32::try_from(row_size)
            .map_err(|_| Error::corrupt("row_size overflowed u32 during verification"))?;
        let RowUnion::Checksum(checksum_row) = codec::parse_row(&row_bytes, row_size_u32)? else {
            return Err(Error::corrupt(format!(
                "expected ChecksumRow at physical index {physical}"
            )));
        };

        let covered = if k == 0 {
            header_bytes.to_vec()
        } else {
            let start = codec::HEADER_LEN as u64 + (k - 1) * CHECKSUM_STRIDE * row_size;
            let len = CHECKSUM_STRIDE * row_size;
            file.read(start, len)?
        };
        let actual = checksum::compute(&covered);
        if actual != checksum_row.crc {
            return Err(Error::corrupt(format!(
                "checksum mismatch at physical index {physical}: file has {:#010x}, computed {:#010x}",
                checksum_row.crc, actual
            )));
        }
        checked += 1;
        k += 1;
    }
    Ok(checked)
}

/// Pass 2: re-parse every complete row and confirm I4 (ChecksumRows
/// occur at exactly the predicted stride and nowhere else).
fn verify_row_structure(file: &FileManager, row_size: u32, complete_rows: u64) -> Result<()> {
    for physical in 0..complete_rows {
        let offset = codec::HEADER_LEN as u64 + physical * u64::from(row_size);
        let bytes = file.read(offset, u64::from(row_size))?;
        let row = codec::parse_row(&bytes, row_size)?;
        let expected_checksum = physical % CHECKSUM_STRIDE == 0;
        if row.is_checksum() != expected_checksum {
            return Err(Error::corrupt(format!(
                "physical index {physical}: is_checksum={}, expected {expected_checksum}",
                row.is_checksum()
            )));
        }
    }
    Ok(())
}
