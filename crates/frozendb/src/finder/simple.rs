//! SimpleFinder (§4.5.2): the reference oracle. O(row_size) memory,
//! O(n) `get_index` via a linear scan; every lookup re-reads the file
//! rather than trusting any cached index.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::{self, RowUnion, StartControl};
use crate::error::{Error, Result};
use crate::file::FileManager;
use crate::uuid7;

use super::Finder;

pub struct SimpleFinder {
    file: Arc<FileManager>,
    row_size: u32,
    expected_next_logical: AtomicU64,
    max_timestamp: AtomicU64,
    tombstoned: AtomicBool,
}

impl SimpleFinder {
    #[must_use]
    pub fn new(file: Arc<FileManager>, row_size: u32) -> Self {
        Self {
            file,
            row_size,
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

    fn check_alive(&self) -> Result<()> {
        if self.tombstoned.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }
}

impl Finder for SimpleFinder {
    fn get_index(&self, key: &[u8; 16]) -> Result<u64> {
        self.check_alive()?;
        if uuid7::is_null_shaped(key) {
            return Err(Error::invalid_input("search key is NullRow-shaped"));
        }
        for physical in 0..self.complete_physical_rows() {
            if let RowUnion::Data(row) = self.read_physical(physical)? {
                if row.key == *key {
                    return Ok(physical);
                }
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
