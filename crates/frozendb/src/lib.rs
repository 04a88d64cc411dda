//! FrozenDB - append-only, single-file, integrity-verified key/value log
//!
//! This crate implements the storage engine backing a FrozenDB file:
//! - Fixed-width row codec with embedded parity and block checksums
//! - Single-writer / multi-reader file manager with advisory locking
//! - Transaction state machine (begin / add / savepoint / commit / rollback)
//! - Key→position finders (linear, binary-search, in-memory)
//! - Offline two-pass verifier

pub mod checksum;
pub mod codec;
pub mod config;
pub mod db;
pub mod emitter;
pub mod error;
pub mod file;
pub mod finder;
pub mod fsops;
pub mod txn;
pub mod uuid7;
pub mod verify;

// Re-exports
pub use checksum::{BLOCK_ROWS, CHECKSUM_STRIDE};
pub use codec::{ChecksumRow, DataRow, EndControl, Header, NullRow, PartialDataRow, RowUnion, StartControl};
pub use config::CreateConfig;
pub use db::{FinderKind, FrozenDb};
pub use emitter::{RowEmitter, SubscriptionHandle};
pub use error::{Error, Result};
pub use file::{FileMode, WriteRequest};
pub use finder::Finder;
pub use fsops::{FsOps, HostFsOps};
pub use verify::VerifyReport;
