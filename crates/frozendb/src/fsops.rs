//! `FsOps` (§9 redesign note): the filesystem operations the create path
//! needs, as an injectable capability rather than a global. The default
//! is the host OS; tests substitute a recording/failing implementation.

use std::fs::File;
use std::io;
use std::path::Path;

/// Filesystem/privilege operations needed by database creation and by
/// the file manager's locking discipline. Every method maps to exactly
/// one syscall family so a test double can simulate failures precisely.
pub trait FsOps: Send + Sync {
    /// Creates the file exclusively (`O_CREAT | O_EXCL`); fails if it
    /// already exists.
    fn create_exclusive(&self, path: &Path, mode: u32) -> io::Result<File>;

    /// `mkdir`-style precondition check: parent exists, is a directory,
    /// and is writable.
    fn check_parent_dir(&self, path: &Path) -> io::Result<()>;

    /// Takes the advisory exclusive, non-blocking lock.
    fn lock_exclusive(&self, file: &File) -> io::Result<()>;

    /// Releases the advisory lock.
    fn unlock(&self, file: &File) -> io::Result<()>;

    /// Applies the filesystem append-only attribute (Linux `chattr +a`,
    /// i.e. `FS_IOC_SETFLAGS` with `FS_APPEND_FL`). Best-effort: callers
    /// decide whether a failure here is fatal.
    fn set_append_only(&self, file: &File) -> io::Result<()>;

    /// True when running under an elevated privilege (`geteuid() == 0`
    /// on Unix).
    fn is_elevated(&self) -> bool;

    /// The `(uid, gid)` of the original unprivileged user that invoked
    /// sudo, read from `SUDO_UID`/`SUDO_GID`, if present.
    fn lookup_sudo_user(&self) -> Option<(u32, u32)>;

    /// `chown`s `path` to the given uid/gid.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
}

/// The host OS implementation, used by [`crate::db::FrozenDb::create`]
/// unless the caller injects something else.
pub struct HostFsOps;

impl FsOps for HostFsOps {
    fn create_exclusive(&self, path: &Path, mode: u32) -> io::Result<File> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)
    }

    fn check_parent_dir(&self, path: &Path) -> io::Result<()> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let Some(parent) = parent else {
            return Ok(());
        };
        let meta = std::fs::metadata(parent)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", parent.display()),
            ));
        }
        if meta.permissions().readonly() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not writable", parent.display()),
            ));
        }
        Ok(())
    }

    fn lock_exclusive(&self, file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN | libc::LOCK_NB) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_append_only(&self, file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
        const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
        const FS_APPEND_FL: libc::c_long = 0x0000_0020;

        let fd = file.as_raw_fd();
        let mut flags: libc::c_long = 0;
        // SAFETY: FS_IOC_GETFLAGS/SETFLAGS are the standard ext-family
        // attribute ioctls; `flags` is a single `long` as the kernel ABI
        // expects.
        unsafe {
            if libc::ioctl(fd, FS_IOC_GETFLAGS, std::ptr::addr_of_mut!(flags)) != 0 {
                return Err(io::Error::last_os_error());
            }
            flags |= FS_APPEND_FL;
            if libc::ioctl(fd, FS_IOC_SETFLAGS, std::ptr::addr_of!(flags)) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_append_only(&self, _file: &File) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "append-only attribute is only supported on Linux",
        ))
    }

    fn is_elevated(&self) -> bool {
        // SAFETY: geteuid takes no arguments and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn lookup_sudo_user(&self) -> Option<(u32, u32)> {
        let uid: u32 = std::env::var("SUDO_UID").ok()?.parse().ok()?;
        let gid: u32 = std::env::var("SUDO_GID").ok()?.parse().ok()?;
        Some((uid, gid))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| io::Error::other(e.to_string()))
    }
}
