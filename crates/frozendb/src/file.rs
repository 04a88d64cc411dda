//! File manager (C3): single-writer / multi-reader access to the backing
//! `.fdb` file. Reads are lock-free positional I/O; the sole writer runs
//! on a dedicated thread fed by a FIFO channel, and `durable_size` is the
//! only synchronization readers need.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fsops::FsOps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

/// One block submitted to the writer thread. `ack` carries back the
/// physical byte offset the block was durably written at, or the error
/// that tombstoned the manager.
pub struct WriteRequest {
    pub bytes: Vec<u8>,
    pub ack: crossbeam_channel::Sender<Result<u64>>,
}

struct Inner {
    file: File,
    path: PathBuf,
    mode: FileMode,
    durable_size: AtomicU64,
    closed: AtomicBool,
    writer_installed: AtomicBool,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
}

/// The file manager handle; cheap to clone, all clones share one
/// underlying file and writer slot.
#[derive(Clone)]
pub struct FileManager {
    inner: Arc<Inner>,
}

impl FileManager {
    /// Opens an existing file. `Write` mode takes the advisory exclusive
    /// non-blocking lock; failure to acquire it is a `Write` error.
    pub fn open(path: &Path, mode: FileMode, fsops: &dyn FsOps) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == FileMode::Write {
            options.append(true);
        }
        let file = options
            .open(path)
            .map_err(|e| Error::read_cause(format!("opening {}", path.display()), e))?;

        if mode == FileMode::Write {
            fsops.lock_exclusive(&file).map_err(|e| {
                Error::write(format!("acquiring exclusive lock on {}: {e}", path.display()))
            })?;
        }

        let size = file
            .metadata()
            .map_err(|e| Error::read_cause("stat on open", e))?
            .len();

        Ok(Self {
            inner: Arc::new(Inner {
                file,
                path: path.to_path_buf(),
                mode,
                durable_size: AtomicU64::new(size),
                closed: AtomicBool::new(false),
                writer_installed: AtomicBool::new(false),
                writer_thread: Mutex::new(None),
            }),
        })
    }

    /// Wraps an already-open, already-locked file (used by the create
    /// path, which needs finer control over lock/flag ordering).
    #[must_use]
    pub fn from_open_file(file: File, path: PathBuf, mode: FileMode, initial_size: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                file,
                path,
                mode,
                durable_size: AtomicU64::new(initial_size),
                closed: AtomicBool::new(false),
                writer_installed: AtomicBool::new(false),
                writer_thread: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.durable_size.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Tombstoned);
        }
        Ok(())
    }

    /// Random read. Fails with `InvalidInput` if the requested range is
    /// not yet durable, `Tombstoned` if closed, `CorruptDatabase` if the
    /// underlying I/O fails on this call (which also tombstones the
    /// manager for every subsequent call).
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.check_open()?;
        let durable = self.size();
        if offset.saturating_add(size) > durable {
            return Err(Error::invalid_input(format!(
                "read [{offset}, {}) exceeds durable size {durable}",
                offset + size
            )));
        }
        let mut buf = vec![0u8; size as usize];
        match self.inner.file.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.tombstone();
                Err(Error::corrupt(format!("positional read failed: {e}")))
            }
        }
    }

    /// Installs the sole writer thread, consuming `WriteRequest`s FIFO
    /// off `rx` until it disconnects. Rejected outside `Write` mode or if
    /// a writer is already installed.
    pub fn set_writer(&self, rx: crossbeam_channel::Receiver<WriteRequest>) -> Result<()> {
        self.check_open()?;
        if self.inner.mode != FileMode::Write {
            return Err(Error::invalid_action("set_writer called on a read-mode file manager"));
        }
        if self
            .inner
            .writer_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::invalid_action("a writer is already installed"));
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("frozendb-writer".into())
            .spawn(move || writer_loop(&inner, &rx))
            .map_err(|e| Error::write(format!("spawning writer thread: {e}")))?;
        *self.inner.writer_thread.lock() = Some(handle);
        Ok(())
    }

    /// Joins the writer thread; idempotent, safe to call after `close`.
    pub fn writer_closed(&self) {
        if let Some(handle) = self.inner.writer_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn tombstone(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// First caller wins: tombstones the manager and releases the lock.
    pub fn close(&self, fsops: &dyn FsOps) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.inner.mode == FileMode::Write
        {
            let _ = fsops.unlock(&self.inner.file);
        }
    }

    #[must_use]
    pub fn is_tombstoned(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn writer_loop(inner: &Arc<Inner>, rx: &crossbeam_channel::Receiver<WriteRequest>) {
    while let Ok(req) = rx.recv() {
        let result = write_one(inner, &req.bytes);
        if result.is_err() {
            inner.closed.store(true, Ordering::Release);
        }
        // The receiver may have gone away (engine tombstoned concurrently
        // elsewhere); a dropped ack channel is not this thread's problem.
        let _ = req.ack.send(result);
    }
}

fn write_one(inner: &Arc<Inner>, bytes: &[u8]) -> Result<u64> {
    use std::io::Write as _;
    let offset = inner.durable_size.load(Ordering::Acquire);
    (&inner.file)
        .write_all(bytes)
        .map_err(|e| Error::write_cause("append write failed", e))?;
    (&inner.file)
        .sync_data()
        .map_err(|e| Error::write_cause("fsync after append failed", e))?;
    inner
        .durable_size
        .store(offset + bytes.len() as u64, Ordering::Release);
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::HostFsOps;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fm = FileManager::from_open_file(file, path, FileMode::Write, 0);

        let (tx, rx) = crossbeam_channel::unbounded();
        fm.set_writer(rx).unwrap();

        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        tx.send(WriteRequest {
            bytes: b"hello!!!".to_vec(),
            ack: ack_tx,
        })
        .unwrap();
        let offset = ack_rx.recv().unwrap().unwrap();
        assert_eq!(offset, 0);
        assert_eq!(fm.size(), 8);

        let read = fm.read(0, 8).unwrap();
        assert_eq!(&read, b"hello!!!");

        drop(tx);
        fm.writer_closed();
        fm.close(&HostFsOps);
    }

    #[test]
    fn read_past_durable_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fm = FileManager::from_open_file(file, path, FileMode::Read, 0);
        assert!(fm.read(0, 1).is_err());
    }

    #[test]
    fn read_after_close_is_tombstoned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fm = FileManager::from_open_file(file, path, FileMode::Read, 0);
        fm.close(&HostFsOps);
        assert!(matches!(fm.read(0, 0), Err(Error::Tombstoned)));
    }
}
