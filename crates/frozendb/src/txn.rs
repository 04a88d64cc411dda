//! Transaction engine (C6): drives the row-level state machine that
//! turns `begin` / `add_row` / `savepoint` / `commit` / `rollback` into
//! a byte stream for the file manager, inserting due `ChecksumRow`s at
//! block boundaries and emitting every durable row through C4.
//!
//! The engine defers materializing a row until its final `end_control`
//! is known: `add_row` holds the newest row in memory (`pending`) and
//! only writes it once a following call determines whether it is a
//! plain continuation (`RE`) or the transaction's terminator. This is
//! how two `AddRow` calls followed by `Commit` produce exactly two
//! physical rows rather than three.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::checksum::{self, RollingChecksum};
use crate::codec::{self, ChecksumRow, DataRow, EndControl, NullRow, RowUnion, StartControl};
use crate::emitter::RowEmitter;
use crate::error::{Error, Result};
use crate::file::{FileManager, WriteRequest};
use crate::uuid7;

const MAX_ROWS_PER_TRANSACTION: u32 = 100;
const MAX_SAVEPOINT_DEPTH: u8 = 9;

struct PendingRow {
    start: StartControl,
    key: [u8; 16],
    value: serde_json::Value,
}

struct OpenState {
    depth: u8,
    rows_in_tx: u32,
    /// True once a row of this transaction has actually been written
    /// durably — distinct from "a pending row has been designated", since
    /// a pending row can still be discarded whole by `rollback` without
    /// ever reaching the file.
    any_row_flushed: bool,
    pending: Option<PendingRow>,
}

enum EngineState {
    Idle,
    Open(OpenState),
    Terminal,
}

struct EngineInner {
    state: EngineState,
    next_physical: u64,
    block_start_physical: u64,
    hasher: RollingChecksum,
    next_logical: u64,
}

pub struct TransactionEngine {
    write_tx: crossbeam_channel::Sender<WriteRequest>,
    emitter: Arc<RowEmitter>,
    row_size: u32,
    guard: Mutex<EngineInner>,
    now_source: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl TransactionEngine {
    /// Builds the engine against an already-open `file` whose writer has
    /// not yet been installed. Reconstructs the rolling checksum window
    /// by re-reading bytes since the most recent `ChecksumRow`, so a
    /// reopened database resumes mid-block correctly.
    pub fn open(file: &FileManager, emitter: Arc<RowEmitter>, row_size: u32) -> Result<Self> {
        Self::with_clock(file, emitter, row_size, default_now_ms)
    }

    pub fn with_clock(
        file: &FileManager,
        emitter: Arc<RowEmitter>,
        row_size: u32,
        now_source: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Result<Self> {
        let total_physical = (file.size() - codec::HEADER_LEN as u64) / u64::from(row_size);
        let block_start_physical = if total_physical == 0 {
            0
        } else {
            ((total_physical - 1) / checksum::CHECKSUM_STRIDE) * checksum::CHECKSUM_STRIDE
        };
        let window_start = codec::HEADER_LEN as u64 + block_start_physical * u64::from(row_size);
        let window_end = codec::HEADER_LEN as u64 + total_physical * u64::from(row_size);
        let mut hasher = RollingChecksum::new();
        if window_end > window_start {
            let bytes = file.read(window_start, window_end - window_start)?;
            hasher.update(&bytes);
        }

        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        file.set_writer(write_rx)?;

        Ok(Self {
            write_tx,
            emitter,
            row_size,
            guard: Mutex::new(EngineInner {
                state: EngineState::Idle,
                next_physical: total_physical,
                block_start_physical,
                hasher,
                next_logical: checksum::num_logical_rows(total_physical),
            }),
            now_source: Box::new(now_source),
        })
    }

    fn now_ms(&self) -> u64 {
        (self.now_source)()
    }

    fn take_open(inner: &mut EngineInner) -> Result<OpenState> {
        match std::mem::replace(&mut inner.state, EngineState::Terminal) {
            EngineState::Open(open) => Ok(open),
            EngineState::Idle => {
                inner.state = EngineState::Idle;
                Err(Error::invalid_action("no transaction is open"))
            }
            EngineState::Terminal => Err(Error::Tombstoned),
        }
    }

    /// Writes `bytes` through the file manager and blocks for the
    /// durability ack, inserting a due `ChecksumRow` first if `bytes`
    /// would land on a checksum-stride physical index.
    fn append_row(&self, inner: &mut EngineInner, bytes: Vec<u8>) -> Result<u64> {
        if inner.next_physical != 0 && inner.next_physical % checksum::CHECKSUM_STRIDE == 0 {
            let finished = std::mem::take(&mut inner.hasher);
            let crc = finished.finalize();
            let checksum_bytes = codec::marshal_checksum_row(ChecksumRow { crc }, self.row_size)?;
            self.append_raw(inner, true, checksum_bytes)?;
        }
        self.append_raw(inner, false, bytes)
    }

    fn append_raw(&self, inner: &mut EngineInner, is_checksum: bool, bytes: Vec<u8>) -> Result<u64> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.write_tx
            .send(WriteRequest {
                bytes: bytes.clone(),
                ack: ack_tx,
            })
            .map_err(|_| Error::Tombstoned)?;
        ack_rx.recv().map_err(|_| Error::Tombstoned)??;

        let physical = inner.next_physical;
        inner.next_physical += 1;
        if is_checksum {
            inner.hasher = RollingChecksum::new();
            inner.block_start_physical = physical;
        }
        inner.hasher.update(&bytes);
        Ok(physical)
    }

    /// Marshals, appends, and emits a Data/Null row, advancing the
    /// logical-index counter. Tombstones the engine if a subscriber
    /// rejects the row.
    fn flush_row(&self, inner: &mut EngineInner, row: RowUnion) -> Result<()> {
        let bytes = match &row {
            RowUnion::Data(d) => codec::marshal_data_row(d, self.row_size)?,
            RowUnion::Null(n) => codec::marshal_null_row(n, self.row_size)?,
            RowUnion::Checksum(_) | RowUnion::Partial(_) => {
                return Err(Error::invalid_input("engine can only flush Data/Null rows"))
            }
        };
        self.append_row(inner, bytes)?;
        let logical = inner.next_logical;
        inner.next_logical += 1;
        if let Err(e) = self.emitter.emit(logical, &row) {
            inner.state = EngineState::Terminal;
            return Err(e);
        }
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        let mut inner = self.guard.lock();
        match inner.state {
            EngineState::Idle => {
                inner.state = EngineState::Open(OpenState {
                    depth: 0,
                    rows_in_tx: 0,
                    any_row_flushed: false,
                    pending: None,
                });
                Ok(())
            }
            EngineState::Open(_) => Err(Error::invalid_action("a transaction is already open")),
            EngineState::Terminal => Err(Error::Tombstoned),
        }
    }

    pub fn add_row(&self, key: [u8; 16], value: serde_json::Value) -> Result<()> {
        let mut inner = self.guard.lock();
        let mut open = Self::take_open(&mut inner)?;

        if open.rows_in_tx == MAX_ROWS_PER_TRANSACTION {
            inner.state = EngineState::Open(open);
            return Err(Error::invalid_action(format!(
                "row {} exceeds transaction limit",
                MAX_ROWS_PER_TRANSACTION + 1
            )));
        }
        if let Err(e) = uuid7::validate(&key) {
            inner.state = EngineState::Open(open);
            return Err(e);
        }
        if uuid7::is_null_shaped(&key) {
            inner.state = EngineState::Open(open);
            return Err(Error::invalid_input("key is NullRow-shaped"));
        }
        let value_bytes = match serde_json::to_vec(&value) {
            Ok(b) => b,
            Err(e) => {
                inner.state = EngineState::Open(open);
                return Err(Error::invalid_input(format!("value does not marshal to JSON: {e}")));
            }
        };
        let capacity = match codec::payload_capacity(self.row_size) {
            Ok(c) => c,
            Err(e) => {
                inner.state = EngineState::Open(open);
                return Err(e);
            }
        };
        if 16 + value_bytes.len() > capacity {
            inner.state = EngineState::Open(open);
            return Err(Error::invalid_input(format!(
                "marshalled row would be {} bytes, row holds {capacity}",
                16 + value_bytes.len()
            )));
        }

        if let Some(previous) = open.pending.take() {
            let row = RowUnion::Data(DataRow {
                start: previous.start,
                end: EndControl::RowEnd,
                key: previous.key,
                value: previous.value,
            });
            if let Err(e) = self.flush_row(&mut inner, row) {
                return Err(e); // engine already tombstoned by flush_row
            }
            open.any_row_flushed = true;
        }

        let start = if open.any_row_flushed {
            StartControl::Continue
        } else {
            StartControl::Transaction
        };
        open.pending = Some(PendingRow { start, key, value });
        open.rows_in_tx += 1;
        inner.state = EngineState::Open(open);
        Ok(())
    }

    /// Logical savepoint index = depth after this call (1-9).
    pub fn savepoint(&self) -> Result<u8> {
        let mut inner = self.guard.lock();
        let mut open = Self::take_open(&mut inner)?;

        if open.depth >= MAX_SAVEPOINT_DEPTH {
            inner.state = EngineState::Open(open);
            return Err(Error::invalid_action("savepoint depth exhausted"));
        }

        if let Some(pending) = open.pending.take() {
            let row = RowUnion::Data(DataRow {
                start: pending.start,
                end: EndControl::SavepointContinue,
                key: pending.key,
                value: pending.value,
            });
            if let Err(e) = self.flush_row(&mut inner, row) {
                return Err(e);
            }
            open.any_row_flushed = true;
        }
        // If no pending row exists, the most recently durable row is
        // already the savepoint boundary; nothing further to write.

        open.depth += 1;
        let index = open.depth;
        inner.state = EngineState::Open(open);
        Ok(index)
    }

    pub fn commit(&self) -> Result<()> {
        let mut inner = self.guard.lock();
        let open = Self::take_open(&mut inner)?;

        let row = if let Some(pending) = open.pending {
            RowUnion::Data(DataRow {
                start: pending.start,
                end: EndControl::TransactionCommit,
                key: pending.key,
                value: pending.value,
            })
        } else {
            let start = if open.any_row_flushed {
                StartControl::Continue
            } else {
                StartControl::Transaction
            };
            RowUnion::Null(NullRow {
                start,
                end: EndControl::TransactionCommit,
                timestamp_ms: self.now_ms(),
            })
        };

        if let Err(e) = self.flush_row(&mut inner, row) {
            return Err(e);
        }
        inner.state = EngineState::Idle;
        Ok(())
    }

    /// `n == 0` is a full rollback; `n` in `1..=9` rolls back to that
    /// savepoint. Any pending (never-flushed) row is discarded, which is
    /// why a key added after the targeted savepoint never becomes
    /// durable or indexed.
    pub fn rollback(&self, n: u8) -> Result<()> {
        let mut inner = self.guard.lock();
        let open = Self::take_open(&mut inner)?;

        if n > open.depth {
            inner.state = EngineState::Open(open);
            return Err(Error::invalid_action(format!(
                "rollback target savepoint {n} exceeds current depth {}",
                open.depth
            )));
        }

        let end = if n == 0 {
            EndControl::FullRollback
        } else {
            EndControl::SavepointMarker(n)
        };
        let start = if open.any_row_flushed {
            StartControl::Continue
        } else {
            StartControl::Transaction
        };
        let row = RowUnion::Null(NullRow {
            start,
            end,
            timestamp_ms: self.now_ms(),
        });

        if let Err(e) = self.flush_row(&mut inner, row) {
            return Err(e);
        }
        inner.state = EngineState::Idle;
        Ok(())
    }

    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        matches!(self.guard.lock().state, EngineState::Terminal)
    }
}

fn default_now_ms() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let wall = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    // Guards against two NullRows minted within the same millisecond
    // colliding in tests; monotonic within a process.
    let bumped = COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
    wall.max(bumped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileMode;
    use serde_json::json;
    use std::fs::OpenOptions;

    fn new_engine(row_size: u32) -> (tempfile::TempDir, Arc<FileManager>, TransactionEngine, Arc<RowEmitter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.fdb");
        let header = codec::Header { row_size, skew_ms: 0 };
        let mut bytes = header.marshal().unwrap().to_vec();
        let crc = crate::checksum::compute(&bytes);
        bytes.extend(codec::marshal_checksum_row(ChecksumRow { crc }, row_size).unwrap());
        std::fs::write(&path, &bytes).unwrap();

        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        let fm = Arc::new(FileManager::from_open_file(file, path, FileMode::Write, size));
        let emitter = Arc::new(RowEmitter::new());
        let mut counter = 0u64;
        let engine = TransactionEngine::with_clock(&fm, Arc::clone(&emitter), row_size, move || {
            counter += 1;
            counter
        })
        .unwrap();
        (dir, fm, engine, emitter)
    }

    fn key(ts: u64, disambiguator: u8) -> [u8; 16] {
        let mut k = uuid7::null_key_for_timestamp(ts);
        k[9] = disambiguator;
        k
    }

    #[test]
    fn two_row_transaction_writes_exactly_two_rows() {
        let (_dir, fm, engine, emitter) = new_engine(256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        emitter.subscribe(move |logical, row| {
            seen_clone.lock().push((logical, row.clone()));
            Ok(())
        });

        engine.begin().unwrap();
        engine.add_row(key(10, 1), json!({"v": 1})).unwrap();
        engine.add_row(key(20, 2), json!({"v": 2})).unwrap();
        engine.commit().unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 0);
        assert_eq!(events[1].0, 1);
        match &events[0].1 {
            RowUnion::Data(d) => {
                assert_eq!(d.start, StartControl::Transaction);
                assert_eq!(d.end, EndControl::RowEnd);
            }
            other => panic!("expected DataRow, got {other:?}"),
        }
        match &events[1].1 {
            RowUnion::Data(d) => {
                assert_eq!(d.start, StartControl::Continue);
                assert_eq!(d.end, EndControl::TransactionCommit);
            }
            other => panic!("expected DataRow, got {other:?}"),
        }
        // header(64) + initial checksum(256) + two data rows(256 each).
        assert_eq!(fm.size(), 64 + 256 + 256 + 256);
    }

    #[test]
    fn empty_transaction_writes_one_null_row() {
        let (_dir, _fm, engine, emitter) = new_engine(256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        emitter.subscribe(move |logical, row| {
            seen_clone.lock().push((logical, row.clone()));
            Ok(())
        });

        engine.begin().unwrap();
        engine.commit().unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        match &events[0].1 {
            RowUnion::Null(n) => assert_eq!(n.end, EndControl::TransactionCommit),
            other => panic!("expected NullRow, got {other:?}"),
        }
    }

    #[test]
    fn savepoint_then_rollback_discards_unflushed_row() {
        let (_dir, _fm, engine, emitter) = new_engine(256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        emitter.subscribe(move |logical, row| {
            seen_clone.lock().push((logical, row.clone()));
            Ok(())
        });

        engine.begin().unwrap();
        engine.add_row(key(10, 1), json!({"v": 1})).unwrap();
        let idx = engine.savepoint().unwrap();
        assert_eq!(idx, 1);
        engine.add_row(key(20, 2), json!({"v": 2})).unwrap();
        engine.rollback(1).unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        match &events[0].1 {
            RowUnion::Data(d) => assert_eq!(d.end, EndControl::SavepointContinue),
            other => panic!("expected DataRow, got {other:?}"),
        }
        match &events[1].1 {
            RowUnion::Null(n) => assert_eq!(n.end, EndControl::SavepointMarker(1)),
            other => panic!("expected NullRow, got {other:?}"),
        }
    }

    #[test]
    fn row_limit_enforced() {
        let (_dir, _fm, engine, _emitter) = new_engine(256);
        engine.begin().unwrap();
        for i in 0..100u64 {
            engine.add_row(key(i, 1), json!({"v": i})).unwrap();
        }
        assert!(engine.add_row(key(200, 1), json!({"v": 0})).is_err());
        // Engine stays usable after a rejected add_row.
        engine.commit().unwrap();
    }

    #[test]
    fn rollback_target_above_depth_rejected() {
        let (_dir, _fm, engine, _emitter) = new_engine(256);
        engine.begin().unwrap();
        engine.add_row(key(10, 1), json!({"v": 1})).unwrap();
        assert!(engine.rollback(2).is_err());
        engine.rollback(0).unwrap();
    }

    #[test]
    fn full_rollback_of_sole_pending_row_starts_the_transaction() {
        // begin(); add_row(); rollback(0) with no intervening flush: the
        // discarded add_row must not leak into the NullRow's
        // start_control. This NullRow is the only physical row ever
        // written for the transaction, so per I5 it must carry start=T.
        let (_dir, _fm, engine, emitter) = new_engine(256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        emitter.subscribe(move |logical, row| {
            seen_clone.lock().push((logical, row.clone()));
            Ok(())
        });

        engine.begin().unwrap();
        engine.add_row(key(10, 1), json!({"v": 1})).unwrap();
        engine.rollback(0).unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        match &events[0].1 {
            RowUnion::Null(n) => {
                assert_eq!(n.start, StartControl::Transaction);
                assert_eq!(n.end, EndControl::FullRollback);
            }
            other => panic!("expected NullRow, got {other:?}"),
        }
    }
}
