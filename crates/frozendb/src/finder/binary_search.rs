//! BinarySearchFinder (§4.5.3): FuzzyBinarySearch over the logical
//! sequence — bisect on UUIDv7 timestamps, then scan outward within
//! `skew_ms` for an exact key match.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::checksum;
use crate::codec::{self, RowUnion, StartControl};
use crate::error::{Error, Result};
use crate::file::FileManager;
use crate::uuid7;

use super::Finder;

pub struct BinarySearchFinder {
    file: Arc<FileManager>,
    row_size: u32,
    skew_ms: u64,
    expected_next_logical: AtomicU64,
    max_timestamp: AtomicU64,
    tombstoned: AtomicBool,
}

impl BinarySearchFinder {
    #[must_use]
    pub fn new(file: Arc<FileManager>, row_size: u32, skew_ms: u32) -> Self {
        Self {
            file,
            row_size,
            skew_ms: u64::from(skew_ms),
            expected_next_logical: AtomicU64::new(0),
            max_timestamp: AtomicU64::new(0),
            tombstoned: AtomicBool::new(false),
        }
    }

    fn read_physical(&self, physical: u64) -> Result<RowUnion> {
        let offset = codec::HEADER_LEN as u64 + physical * u64::from(self.row_size);
        let bytes = self.file.read(offset, u64::from(self.row_size))?;
        codec::parse_row(&bytes, self.row_size)
    }

    fn complete_physical_rows(&self) -> u64 {
        (self.file.size() - codec::HEADER_LEN as u64) / u64::from(self.row_size)
    }

    fn num_logical(&self) -> u64 {
        checksum::num_logical_rows(self.complete_physical_rows())
    }

    /// Timestamp and key at a logical (DataRow/NullRow-only) index.
    fn ts_and_key_at_logical(&self, logical: u64) -> Result<(u64, [u8; 16])> {
        let physical = checksum::physical_of_logical(logical);
        match self.read_physical(physical)? {
            RowUnion::Data(d) => Ok((uuid7::extract_timestamp_ms(&d.key), d.key)),
            RowUnion::Null(n) => Ok((n.timestamp_ms, uuid7::null_key_for_timestamp(n.timestamp_ms))),
            _ => Err(Error::corrupt("logical index resolved to a non-logical row")),
        }
    }

    fn lower_bound(&self, target: u64, num_logical: u64) -> Result<u64> {
        let mut lo = 0u64;
        let mut hi = num_logical;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (ts, _) = self.ts_and_key_at_logical(mid)?;
            if ts < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn within_skew(&self, target: u64, ts: u64) -> bool {
        target.abs_diff(ts) <= self.skew_ms
    }

    fn check_alive(&self) -> Result<()> {
        if self.tombstoned.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }
}

impl Finder for BinarySearchFinder {
    fn get_index(&self, key: &[u8; 16]) -> Result<u64> {
        self.check_alive()?;
        if uuid7::is_null_shaped(key) {
            return Err(Error::invalid_input("search key is NullRow-shaped"));
        }
        let num_logical = self.num_logical();
        if num_logical == 0 {
            return Err(Error::KeyNotFound);
        }
        let target = uuid7::extract_timestamp_ms(key);
        let bound = self.lower_bound(target, num_logical)?;
        let candidate = bound.min(num_logical - 1);

        let (ts, found_key) = self.ts_and_key_at_logical(candidate)?;
        if self.within_skew(target, ts) && found_key == *key {
            return Ok(checksum::physical_of_logical(candidate));
        }

        let mut i = candidate;
        while i > 0 {
            i -= 1;
            let (ts, found_key) = self.ts_and_key_at_logical(i)?;
            if !self.within_skew(target, ts) {
                break;
            }
            if found_key == *key {
                return Ok(checksum::physical_of_logical(i));
            }
        }

        let mut i = candidate;
        while i + 1 < num_logical {
            i += 1;
            let (ts, found_key) = self.ts_and_key_at_logical(i)?;
            if !self.within_skew(target, ts) {
                break;
            }
            if found_key == *key {
                return Ok(checksum::physical_of_logical(i));
            }
        }

        Err(Error::KeyNotFound)
    }

    fn get_transaction_start(&self, index: u64) -> Result<u64> {
        self.check_alive()?;
        let row = self.read_physical(index)?;
        if row.is_checksum() {
            return Err(Error::invalid_input("index refers to a ChecksumRow"));
        }
        if row.start_control() == Some(StartControl::Transaction) {
            return Ok(index);
        }
        let mut i = index;
        while i > 0 {
            i -= 1;
            let row = self.read_physical(i)?;
            if row.is_checksum() {
                continue;
            }
            if row.start_control() == Some(StartControl::Transaction) {
                return Ok(i);
            }
        }
        Err(Error::corrupt("no transaction start found scanning backward"))
    }

    fn get_transaction_end(&self, index: u64) -> Result<u64> {
        self.check_alive()?;
        let row = self.read_physical(index)?;
        if row.is_checksum() {
            return Err(Error::invalid_input("index refers to a ChecksumRow"));
        }
        if matches!(row, RowUnion::Null(_)) || row.end_control().is_some_and(codec::EndControl::is_terminal) {
            return Ok(index);
        }
        let total = self.complete_physical_rows();
        let mut i = index + 1;
        while i < total {
            let row = self.read_physical(i)?;
            if row.is_checksum() {
                i += 1;
                continue;
            }
            if matches!(row, RowUnion::Null(_)) || row.end_control().is_some_and(codec::EndControl::is_terminal) {
                return Ok(i);
            }
            i += 1;
        }
        Err(Error::TransactionActive)
    }

    fn max_timestamp(&self) -> u64 {
        self.max_timestamp.load(Ordering::Acquire)
    }

    fn on_row_added(&self, logical_index: u64, row: &RowUnion) -> Result<()> {
        if self.tombstoned.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        if row.is_checksum() {
            return Ok(());
        }
        let expected = self.expected_next_logical.load(Ordering::Acquire);
        if logical_index != expected {
            self.tombstoned.store(true, Ordering::Release);
            return Err(Error::corrupt(format!(
                "finder expected logical index {expected}, got {logical_index}"
            )));
        }
        self.expected_next_logical.store(expected + 1, Ordering::Release);
        let ts = match row {
            RowUnion::Data(d) => Some(uuid7::extract_timestamp_ms(&d.key)),
            RowUnion::Null(n) => Some(n.timestamp_ms),
            RowUnion::Checksum(_) | RowUnion::Partial(_) => None,
        };
        if let Some(ts) = ts {
            self.max_timestamp.fetch_max(ts, Ordering::AcqRel);
        }
        Ok(())
    }

    fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }
}
