//! InMemoryFinder (§4.5.4): three in-memory maps updated in lockstep by
//! `on_row_added`, no file re-reads needed for any query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::checksum;
use crate::codec::{EndControl, RowUnion, StartControl};
use crate::error::{Error, Result};
use crate::uuid7;

use super::Finder;

#[derive(Default)]
struct TxTracker {
    current_start: Option<u64>,
    rows_since_start: Vec<u64>,
}

pub struct InMemoryFinder {
    key_to_physical: RwLock<HashMap<[u8; 16], u64>>,
    tx_start: RwLock<HashMap<u64, u64>>,
    tx_end: RwLock<HashMap<u64, u64>>,
    tracker: Mutex<TxTracker>,
    expected_next_logical: AtomicU64,
    max_timestamp: AtomicU64,
    tombstoned: AtomicBool,
}

impl Default for InMemoryFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFinder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key_to_physical: RwLock::new(HashMap::new()),
            tx_start: RwLock::new(HashMap::new()),
            tx_end: RwLock::new(HashMap::new()),
            tracker: Mutex::new(TxTracker::default()),
            expected_next_logical: AtomicU64::new(0),
            max_timestamp: AtomicU64::new(0),
            tombstoned: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.tombstoned.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }

    fn tombstone_with(&self, reason: impl Into<String>) -> Error {
        self.tombstoned.store(true, Ordering::Release);
        Error::corrupt(reason)
    }

    fn record_transaction_membership(
        &self,
        physical: u64,
        start: Option<StartControl>,
        end: Option<EndControl>,
    ) -> Result<()> {
        let mut tracker = self.tracker.lock();
        if start == Some(StartControl::Transaction) {
            tracker.current_start = Some(physical);
            tracker.rows_since_start.clear();
        }
        let Some(start_physical) = tracker.current_start else {
            return Err(self.tombstone_with(format!(
                "row {physical} continues a transaction with no recorded start"
            )));
        };
        self.tx_start.write().insert(physical, start_physical);
        tracker.rows_since_start.push(physical);

        if end.is_some_and(EndControl::is_terminal) {
            let mut end_map = self.tx_end.write();
            for &p in &tracker.rows_since_start {
                end_map.insert(p, physical);
            }
            tracker.rows_since_start.clear();
            tracker.current_start = None;
        }
        Ok(())
    }
}

impl Finder for InMemoryFinder {
    fn get_index(&self, key: &[u8; 16]) -> Result<u64> {
        self.check_alive()?;
        if uuid7::is_null_shaped(key) {
            return Err(Error::invalid_input("search key is NullRow-shaped"));
        }
        self.key_to_physical
            .read()
            .get(key)
            .copied()
            .ok_or(Error::KeyNotFound)
    }

    fn get_transaction_start(&self, index: u64) -> Result<u64> {
        self.check_alive()?;
        self.tx_start
            .read()
            .get(&index)
            .copied()
            .ok_or_else(|| Error::invalid_input(format!("no transaction recorded at physical index {index}")))
    }

    fn get_transaction_end(&self, index: u64) -> Result<u64> {
        self.check_alive()?;
        if let Some(end) = self.tx_end.read().get(&index).copied() {
            return Ok(end);
        }
        if self.tx_start.read().contains_key(&index) {
            return Err(Error::TransactionActive);
        }
        Err(Error::invalid_input(format!("no transaction recorded at physical index {index}")))
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
            return Err(self.tombstone_with(format!(
                "finder expected logical index {expected}, got {logical_index}"
            )));
        }
        let physical = checksum::physical_of_logical(logical_index);

        let timestamp = match row {
            RowUnion::Data(d) => {
                let mut map = self.key_to_physical.write();
                if map.contains_key(&d.key) {
                    drop(map);
                    return Err(self.tombstone_with(format!("duplicate key at physical index {physical}")));
                }
                map.insert(d.key, physical);
                Some(uuid7::extract_timestamp_ms(&d.key))
            }
            RowUnion::Null(n) => Some(n.timestamp_ms),
            RowUnion::Checksum(_) | RowUnion::Partial(_) => None,
        };

        self.record_transaction_membership(physical, row.start_control(), row.end_control())?;

        if let Some(ts) = timestamp {
            self.max_timestamp.fetch_max(ts, Ordering::AcqRel);
        }
        self.expected_next_logical.store(expected + 1, Ordering::Release);
        Ok(())
    }

    fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }
}
