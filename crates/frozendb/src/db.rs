//! Top-level database handle: wires C1-C7 together behind `create` and
//! `open`, and exposes the user-facing transaction and query surface.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checksum;
use crate::codec::{self, ChecksumRow, Header, RowUnion};
use crate::config::CreateConfig;
use crate::emitter::{RowEmitter, SubscriptionHandle};
use crate::error::{Error, Result};
use crate::file::{FileManager, FileMode};
use crate::finder::binary_search::BinarySearchFinder;
use crate::finder::in_memory::InMemoryFinder;
use crate::finder::simple::SimpleFinder;
use crate::finder::Finder;
use crate::fsops::FsOps;
use crate::txn::TransactionEngine;
use crate::verify::{self, VerifyReport};

/// Which [`Finder`] implementation backs key lookups for a handle.
/// `InMemory` is fastest but costs O(keys) memory; `BinarySearch` and
/// `Simple` re-read the file on every query and cost nothing at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderKind {
    Simple,
    BinarySearch,
    InMemory,
}

pub struct FrozenDb {
    file: Arc<FileManager>,
    fsops: Arc<dyn FsOps>,
    header: Header,
    engine: Option<TransactionEngine>,
    finder: Arc<dyn Finder>,
    emitter: Arc<RowEmitter>,
}

impl FrozenDb {
    /// Creates a new database file exclusively and opens it for writing.
    /// Best-effort steps (append-only attribute, ownership handoff) warn
    /// on failure rather than aborting creation, per the sudo-policy
    /// decision recorded in the design ledger.
    pub fn create(config: &CreateConfig, fsops: Arc<dyn FsOps>, finder_kind: FinderKind) -> Result<Self> {
        config.validate()?;
        fsops
            .check_parent_dir(&config.path)
            .map_err(|e| Error::path(config.path.clone(), e.to_string()))?;

        let file = fsops
            .create_exclusive(&config.path, 0o644)
            .map_err(|e| Error::path(config.path.clone(), format!("create: {e}")))?;
        fsops
            .lock_exclusive(&file)
            .map_err(|e| Error::write(format!("acquiring exclusive lock: {e}")))?;

        let header = Header {
            row_size: config.row_size,
            skew_ms: config.skew_ms,
        };
        let header_bytes = header.marshal()?;
        let initial_checksum = ChecksumRow {
            crc: checksum::compute(&header_bytes),
        };
        let checksum_bytes = codec::marshal_checksum_row(initial_checksum, config.row_size)?;

        {
            use std::io::Write as _;
            (&file)
                .write_all(&header_bytes)
                .map_err(|e| Error::write_cause("writing header", e))?;
            (&file)
                .write_all(&checksum_bytes)
                .map_err(|e| Error::write_cause("writing initial checksum row", e))?;
            (&file)
                .sync_data()
                .map_err(|e| Error::write_cause("fsync after initial write", e))?;
        }

        if let Err(e) = fsops.set_append_only(&file) {
            warn!(path = %config.path.display(), error = %e, "could not set append-only attribute, continuing without it");
        }
        if fsops.is_elevated() {
            if let Some((uid, gid)) = fsops.lookup_sudo_user() {
                if let Err(e) = fsops.chown(&config.path, uid, gid) {
                    warn!(path = %config.path.display(), error = %e, "could not chown database to invoking user");
                }
            }
        }

        let size = codec::HEADER_LEN as u64 + checksum_bytes.len() as u64;
        let fm = Arc::new(FileManager::from_open_file(
            file,
            config.path.clone(),
            FileMode::Write,
            size,
        ));
        info!(path = %config.path.display(), row_size = config.row_size, "created database");

        Self::wire(fm, fsops, header, finder_kind, true)
    }

    /// Opens an existing database file. `Read` mode never installs a
    /// writer; `Write` mode takes the advisory exclusive lock.
    pub fn open(path: &Path, mode: FileMode, fsops: Arc<dyn FsOps>, finder_kind: FinderKind) -> Result<Self> {
        let fm = Arc::new(FileManager::open(path, mode, fsops.as_ref())?);
        let header_bytes = fm.read(0, codec::HEADER_LEN as u64)?;
        let header = Header::parse(&header_bytes)?;
        Self::wire(fm, fsops, header, finder_kind, mode == FileMode::Write)
    }

    fn wire(
        file: Arc<FileManager>,
        fsops: Arc<dyn FsOps>,
        header: Header,
        finder_kind: FinderKind,
        writable: bool,
    ) -> Result<Self> {
        let finder: Arc<dyn Finder> = match finder_kind {
            FinderKind::Simple => Arc::new(SimpleFinder::new(Arc::clone(&file), header.row_size)),
            FinderKind::BinarySearch => Arc::new(BinarySearchFinder::new(
                Arc::clone(&file),
                header.row_size,
                header.skew_ms,
            )),
            FinderKind::InMemory => Arc::new(InMemoryFinder::new()),
        };
        Self::replay_existing(&file, finder.as_ref(), header.row_size)?;

        let emitter = Arc::new(RowEmitter::new());
        let finder_for_emitter = Arc::clone(&finder);
        emitter.subscribe(move |logical, row| finder_for_emitter.on_row_added(logical, row));

        let engine = if writable {
            Some(TransactionEngine::open(&file, Arc::clone(&emitter), header.row_size)?)
        } else {
            None
        };

        Ok(Self {
            file,
            fsops,
            header,
            engine,
            finder,
            emitter,
        })
    }

    /// Feeds every row already durable at open time through the finder so
    /// its in-memory state (or just its logical-index expectation) starts
    /// in sync with the file rather than assuming an empty log.
    fn replay_existing(file: &FileManager, finder: &dyn Finder, row_size: u32) -> Result<()> {
        let complete_rows = (file.size() - codec::HEADER_LEN as u64) / u64::from(row_size);
        let mut logical = 0u64;
        for physical in 0..complete_rows {
            let offset = codec::HEADER_LEN as u64 + physical * u64::from(row_size);
            let bytes = file.read(offset, u64::from(row_size))?;
            let row = codec::parse_row(&bytes, row_size)?;
            let is_checksum = row.is_checksum();
            finder.on_row_added(logical, &row)?;
            if !is_checksum {
                logical += 1;
            }
        }
        debug!(rows_replayed = complete_rows, "primed finder from existing file");
        Ok(())
    }

    fn engine(&self) -> Result<&TransactionEngine> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::invalid_action("database was opened read-only"))
    }

    pub fn begin(&self) -> Result<()> {
        self.engine()?.begin()
    }

    pub fn add_row(&self, key: [u8; 16], value: serde_json::Value) -> Result<()> {
        self.engine()?.add_row(key, value)
    }

    pub fn savepoint(&self) -> Result<u8> {
        self.engine()?.savepoint()
    }

    pub fn commit(&self) -> Result<()> {
        self.engine()?.commit()
    }

    pub fn rollback(&self, n: u8) -> Result<()> {
        self.engine()?.rollback(n)
    }

    /// Reads and returns the JSON value stored at `key`.
    pub fn get(&self, key: &[u8; 16]) -> Result<serde_json::Value> {
        let physical = self.finder.get_index(key)?;
        let offset = codec::HEADER_LEN as u64 + physical * u64::from(self.header.row_size);
        let bytes = self.file.read(offset, u64::from(self.header.row_size))?;
        match codec::parse_row(&bytes, self.header.row_size)? {
            RowUnion::Data(d) => Ok(d.value),
            other => Err(Error::corrupt(format!(
                "finder pointed at a non-DataRow: {other:?}"
            ))),
        }
    }

    pub fn get_transaction_start(&self, physical_index: u64) -> Result<u64> {
        self.finder.get_transaction_start(physical_index)
    }

    pub fn get_transaction_end(&self, physical_index: u64) -> Result<u64> {
        self.finder.get_transaction_end(physical_index)
    }

    #[must_use]
    pub fn max_timestamp(&self) -> u64 {
        self.finder.max_timestamp()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[must_use]
    pub fn header(&self) -> Header {
        self.header
    }

    /// Runs the offline two-pass verifier against the current durable
    /// contents of this handle's file.
    pub fn verify(&self) -> Result<VerifyReport> {
        verify::verify(&self.file)
    }

    /// Registers an additional subscriber alongside the finder's own.
    pub fn subscribe(
        &self,
        callback: impl Fn(u64, &RowUnion) -> Result<()> + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.emitter.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.emitter.unsubscribe(handle);
    }

    /// Joins the writer task (if any) and releases the advisory lock.
    /// Idempotent.
    pub fn close(&self) {
        self.file.writer_closed();
        self.file.close(self.fsops.as_ref());
    }
}

impl Drop for FrozenDb {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::HostFsOps;
    use serde_json::json;

    fn cfg(dir: &std::path::Path) -> CreateConfig {
        CreateConfig::new(dir.join("db.fdb"), 256, 50)
    }

    #[test]
    fn create_then_add_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let db = FrozenDb::create(&cfg(dir.path()), Arc::new(HostFsOps), FinderKind::InMemory).unwrap();

        let key = crate::uuid7::generate_now();
        db.begin().unwrap();
        db.add_row(key, json!({"hello": "world"})).unwrap();
        db.commit().unwrap();

        assert_eq!(db.get(&key).unwrap(), json!({"hello": "world"}));
        assert!(db.verify().is_ok());
    }

    #[test]
    fn reopen_for_read_sees_prior_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.fdb");
        let key = crate::uuid7::generate_now();
        {
            let db = FrozenDb::create(&cfg(dir.path()), Arc::new(HostFsOps), FinderKind::Simple).unwrap();
            db.begin().unwrap();
            db.add_row(key, json!({"v": 1})).unwrap();
            db.commit().unwrap();
        }

        let reopened = FrozenDb::open(&path, FileMode::Read, Arc::new(HostFsOps), FinderKind::Simple).unwrap();
        assert_eq!(reopened.get(&key).unwrap(), json!({"v": 1}));
        assert!(reopened.begin().is_err());
    }

    #[test]
    fn reopen_for_write_can_append_more_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.fdb");
        let key1 = crate::uuid7::generate_now();
        {
            let db = FrozenDb::create(&cfg(dir.path()), Arc::new(HostFsOps), FinderKind::InMemory).unwrap();
            db.begin().unwrap();
            db.add_row(key1, json!({"v": 1})).unwrap();
            db.commit().unwrap();
        }

        let db = FrozenDb::open(&path, FileMode::Write, Arc::new(HostFsOps), FinderKind::InMemory).unwrap();
        let key2 = crate::uuid7::generate_now();
        db.begin().unwrap();
        db.add_row(key2, json!({"v": 2})).unwrap();
        db.commit().unwrap();

        assert_eq!(db.get(&key1).unwrap(), json!({"v": 1}));
        assert_eq!(db.get(&key2).unwrap(), json!({"v": 2}));
        assert!(db.verify().is_ok());
    }
}
