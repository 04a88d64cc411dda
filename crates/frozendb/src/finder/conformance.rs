//! Shared conformance suite (P6): `SimpleFinder`, `BinarySearchFinder`,
//! and `InMemoryFinder` must agree on every query for the same file.

use std::fs::OpenOptions;
use std::sync::Arc;

use serde_json::json;

use crate::codec::{self, ChecksumRow, DataRow, EndControl, Header, NullRow, RowUnion, StartControl};
use crate::file::{FileManager, FileMode};
use crate::uuid7;

use super::binary_search::BinarySearchFinder;
use super::in_memory::InMemoryFinder;
use super::simple::SimpleFinder;
use super::Finder;

const ROW_SIZE: u32 = 256;
const SKEW_MS: u32 = 50;

fn data_key(ts: u64, disambiguator: u8) -> [u8; 16] {
    let mut key = uuid7::null_key_for_timestamp(ts);
    key[9] = disambiguator;
    key
}

/// Writes a header + initial checksum + the given rows to a fresh temp
/// file, returning the file manager and the (logical_index, row) stream
/// a transaction engine would have emitted.
fn build_fixture(rows: &[RowUnion]) -> (tempfile::TempDir, Arc<FileManager>, Vec<(u64, RowUnion)>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.fdb");

    let header = Header {
        row_size: ROW_SIZE,
        skew_ms: SKEW_MS,
    };
    let mut bytes = header.marshal().unwrap().to_vec();
    let initial_checksum = ChecksumRow {
        crc: crate::checksum::compute(&bytes),
    };
    bytes.extend(codec::marshal_checksum_row(initial_checksum, ROW_SIZE).unwrap());

    // None of these fixtures approach `BLOCK_ROWS` rows, so only the
    // initial checksum row above is ever needed.
    let mut emitted = Vec::new();
    let mut logical = 0u64;
    for row in rows {
        let row_bytes = match row {
            RowUnion::Data(d) => codec::marshal_data_row(d, ROW_SIZE).unwrap(),
            RowUnion::Null(n) => codec::marshal_null_row(n, ROW_SIZE).unwrap(),
            RowUnion::Checksum(_) | RowUnion::Partial(_) => panic!("fixture rows must be Data/Null"),
        };
        bytes.extend(row_bytes);
        emitted.push((logical, row.clone()));
        logical += 1;
    }

    std::fs::write(&path, &bytes).unwrap();
    let reopened = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let size = reopened.metadata().unwrap().len();
    let fm = Arc::new(FileManager::from_open_file(reopened, path, FileMode::Read, size));
    (dir, fm, emitted)
}

fn feed_all(finders: &[&dyn Finder], events: &[(u64, RowUnion)]) {
    for (logical, row) in events {
        for finder in finders {
            finder.on_row_added(*logical, row).unwrap();
        }
    }
}

#[test]
fn conformance_two_row_transaction() {
    // Mirrors S2: AddRow(ts=10), AddRow(ts=20), Commit.
    let k1 = data_key(10, 1);
    let k2 = data_key(20, 2);
    let rows = vec![
        RowUnion::Data(DataRow {
            start: StartControl::Transaction,
            end: EndControl::RowEnd,
            key: k1,
            value: json!({"v": 1}),
        }),
        RowUnion::Data(DataRow {
            start: StartControl::Continue,
            end: EndControl::TransactionCommit,
            key: k2,
            value: json!({"v": 2}),
        }),
    ];
    let (_dir, fm, events) = build_fixture(&rows);

    let simple = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE);
    let binary = BinarySearchFinder::new(Arc::clone(&fm), ROW_SIZE, SKEW_MS);
    let in_memory = InMemoryFinder::new();
    let finders: [&dyn Finder; 3] = [&simple, &binary, &in_memory];
    feed_all(&finders, &events);

    for finder in &finders {
        assert_eq!(finder.get_index(&k2).unwrap(), 2, "{}", finder.max_timestamp());
        assert_eq!(finder.get_transaction_start(1).unwrap(), 1);
        assert_eq!(finder.get_transaction_end(1).unwrap(), 2);
        assert_eq!(finder.max_timestamp(), 20);
    }
}

#[test]
fn conformance_empty_transaction_adds_no_key() {
    // Mirrors S3: Begin; Commit with no rows.
    let rows = vec![RowUnion::Null(NullRow {
        start: StartControl::Transaction,
        end: EndControl::TransactionCommit,
        timestamp_ms: 99,
    })];
    let (_dir, fm, events) = build_fixture(&rows);

    let simple = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE);
    let binary = BinarySearchFinder::new(Arc::clone(&fm), ROW_SIZE, SKEW_MS);
    let in_memory = InMemoryFinder::new();
    let finders: [&dyn Finder; 3] = [&simple, &binary, &in_memory];
    feed_all(&finders, &events);

    for finder in &finders {
        assert_eq!(finder.max_timestamp(), 99);
        assert_eq!(finder.get_transaction_start(1).unwrap(), 1);
        assert_eq!(finder.get_transaction_end(1).unwrap(), 1);
    }
}

#[test]
fn conformance_savepoint_rollback_hides_rolled_back_key() {
    // Mirrors S4: Begin; AddRow(k1); Savepoint; [AddRow(k2) never durable]; Rollback(1).
    let k1 = data_key(10, 1);
    let k2 = data_key(20, 2);
    let rows = vec![
        RowUnion::Data(DataRow {
            start: StartControl::Transaction,
            end: EndControl::SavepointContinue,
            key: k1,
            value: json!({"v": 1}),
        }),
        RowUnion::Null(NullRow {
            start: StartControl::Continue,
            end: EndControl::SavepointMarker(1),
            timestamp_ms: 30,
        }),
    ];
    let (_dir, fm, events) = build_fixture(&rows);

    let simple = SimpleFinder::new(Arc::clone(&fm), ROW_SIZE);
    let binary = BinarySearchFinder::new(Arc::clone(&fm), ROW_SIZE, SKEW_MS);
    let in_memory = InMemoryFinder::new();
    let finders: [&dyn Finder; 3] = [&simple, &binary, &in_memory];
    feed_all(&finders, &events);

    for finder in &finders {
        assert_eq!(finder.get_index(&k1).unwrap(), 1);
        assert!(matches!(finder.get_index(&k2), Err(crate::error::Error::KeyNotFound)));
        assert_eq!(finder.get_transaction_end(1).unwrap(), 2);
    }
}

#[test]
fn conformance_tombstones_on_duplicate_key() {
    let k1 = data_key(10, 1);
    let rows = vec![
        RowUnion::Data(DataRow {
            start: StartControl::Transaction,
            end: EndControl::TransactionCommit,
            key: k1,
            value: json!({"v": 1}),
        }),
        RowUnion::Data(DataRow {
            start: StartControl::Transaction,
            end: EndControl::TransactionCommit,
            key: k1,
            value: json!({"v": 2}),
        }),
    ];
    let (_dir, _fm, events) = build_fixture(&rows);
    let in_memory = InMemoryFinder::new();
    in_memory.on_row_added(events[0].0, &events[0].1).unwrap();
    assert!(in_memory.on_row_added(events[1].0, &events[1].1).is_err());
    assert!(in_memory.is_tombstoned());
    assert!(in_memory.get_index(&k1).is_err());
}
