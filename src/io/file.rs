use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    ops::BitOr,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::warn;

/// Open-mode flag set for [`FileHandle::open`].
///
/// Flags combine with `|`:
///
/// ```
/// use braid::io::OpenMode;
///
/// let mode = OpenMode::RDWR | OpenMode::CREAT | OpenMode::NO_LOCK;
/// assert!(mode.contains(OpenMode::CREAT));
/// assert!(!mode.contains(OpenMode::DIRECT));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Open for reading only.
    pub const RDONLY: OpenMode = OpenMode(1 << 0);
    /// Open for writing only.
    pub const WRONLY: OpenMode = OpenMode(1 << 1);
    /// Open for reading and writing.
    pub const RDWR: OpenMode = OpenMode(1 << 2);
    /// Create the file if it does not exist.
    pub const CREAT: OpenMode = OpenMode(1 << 3);
    /// Truncate the file on open.
    pub const TRUNC: OpenMode = OpenMode(1 << 4);
    /// Request unbuffered I/O; falls back with a warning if unsupported.
    pub const DIRECT: OpenMode = OpenMode(1 << 5);
    /// Require unbuffered I/O; the open fails if unsupported.
    pub const REQUIRE_DIRECT: OpenMode = OpenMode(1 << 6);
    /// Synchronous writes.
    pub const SYNC: OpenMode = OpenMode(1 << 7);
    /// Skip the advisory range lock taken on open.
    pub const NO_LOCK: OpenMode = OpenMode(1 << 8);

    /// Returns `true` if every flag of `other` is set in `self`.
    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Errors raised by the raw file wrapper.
#[derive(Debug, Error)]
pub enum FileError {
    /// A file system call failed.
    #[error("{op} failed for {path}")]
    Io {
        /// Name of the failing operation.
        op: &'static str,
        /// The affected path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// `REQUIRE_DIRECT` was requested but the system cannot honor it.
    #[error("direct I/O required but not supported for {path}")]
    DirectUnsupported {
        /// The affected path.
        path: PathBuf,
    },
    /// The advisory lock could not be taken.
    #[error("advisory lock failed for {path}")]
    Lock {
        /// The affected path.
        path: PathBuf,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },
    /// Resizing was requested on a block device.
    #[error("cannot resize block device {path}")]
    DeviceResize {
        /// The affected path.
        path: PathBuf,
    },
}

/// A file descriptor with the open-flag, locking and sizing behavior the
/// spill layer expects.
///
/// An advisory whole-range lock is taken on open unless
/// [`OpenMode::NO_LOCK`] is set: read locks for read-only handles, write
/// locks otherwise. The lock (and the descriptor) is released on
/// [`close`](FileHandle::close) or drop.
pub struct FileHandle {
    file: Option<File>,
    path: PathBuf,
    mode: OpenMode,
    is_device: bool,
}

impl FileHandle {
    /// Opens `path` with the given mode flags.
    ///
    /// `DIRECT` requests unbuffered I/O where the platform supports it; if
    /// the open fails with `EINVAL` the flag is dropped with a warning
    /// unless `REQUIRE_DIRECT` is also set, in which case the open fails.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, FileError> {
        let path = path.as_ref().to_path_buf();

        let file = match open_with_flags(&path, mode, true) {
            Ok(file) => file,
            Err(source) if direct_fallback_applies(&source, mode) => {
                if mode.contains(OpenMode::REQUIRE_DIRECT) {
                    return Err(FileError::DirectUnsupported { path });
                }
                warn!(path = %path.display(), "direct I/O unsupported, retrying buffered");
                open_with_flags(&path, mode, false).map_err(|source| FileError::Io {
                    op: "open",
                    path: path.clone(),
                    source,
                })?
            }
            Err(source) => {
                return Err(FileError::Io {
                    op: "open",
                    path,
                    source,
                })
            }
        };

        let is_device = {
            use std::os::unix::fs::FileTypeExt;
            file.metadata()
                .map_err(|source| FileError::Io {
                    op: "stat",
                    path: path.clone(),
                    source,
                })?
                .file_type()
                .is_block_device()
        };

        let handle = Self {
            file: Some(file),
            path,
            mode,
            is_device,
        };

        if !mode.contains(OpenMode::NO_LOCK) {
            handle.lock()?;
        }
        Ok(handle)
    }

    /// Returns the open file, or `None` after [`close`](FileHandle::close).
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Returns the path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the handle refers to a block device.
    pub fn is_device(&self) -> bool {
        self.is_device
    }

    /// Reports the current size in bytes.
    ///
    /// Measured by seeking to the end, which also works for raw devices
    /// where metadata reports zero.
    pub fn size(&self) -> Result<u64, FileError> {
        let file = self.open_file()?;
        (&*file).seek(SeekFrom::End(0)).map_err(|source| FileError::Io {
            op: "seek",
            path: self.path.clone(),
            source,
        })
    }

    /// Truncates or extends the file to `new_size` bytes.
    ///
    /// Not permitted on block devices or read-only handles.
    pub fn set_size(&self, new_size: u64) -> Result<(), FileError> {
        if self.is_device {
            return Err(FileError::DeviceResize {
                path: self.path.clone(),
            });
        }
        if self.mode.contains(OpenMode::RDONLY) {
            return Ok(());
        }
        self.open_file()?.set_len(new_size).map_err(|source| FileError::Io {
            op: "truncate",
            path: self.path.clone(),
            source,
        })
    }

    /// Releases the descriptor (and with it the advisory lock). Idempotent.
    pub fn close(&mut self) {
        self.file.take();
    }

    /// Removes the file from the file system; skipped for device nodes.
    pub fn unlink(&self) -> Result<(), FileError> {
        if self.is_device {
            warn!(path = %self.path.display(), "unlink skipped, path is a device node");
            return Ok(());
        }
        std::fs::remove_file(&self.path).map_err(|source| FileError::Io {
            op: "unlink",
            path: self.path.clone(),
            source,
        })
    }

    fn open_file(&self) -> Result<&File, FileError> {
        self.file.as_ref().ok_or_else(|| FileError::Io {
            op: "access",
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file handle is closed"),
        })
    }

    /// Takes the advisory whole-range lock.
    fn lock(&self) -> Result<(), FileError> {
        use nix::fcntl::{fcntl, FcntlArg};
        use std::os::unix::io::AsRawFd;

        let file = self.open_file()?;

        // SAFETY: flock is a plain C struct; an all-zero value is a valid
        // starting point on every supported platform.
        let mut lock: nix::libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = if self.mode.contains(OpenMode::RDONLY) {
            nix::libc::F_RDLCK as _
        } else {
            nix::libc::F_WRLCK as _
        };
        lock.l_whence = nix::libc::SEEK_SET as _;
        lock.l_start = 0;
        lock.l_len = 0; // whole range

        fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&lock))
            .map(|_| ())
            .map_err(|source| FileError::Lock {
                path: self.path.clone(),
                source,
            })
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_with_flags(path: &Path, mode: OpenMode, with_direct: bool) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options
        .read(mode.contains(OpenMode::RDONLY) || mode.contains(OpenMode::RDWR))
        .write(mode.contains(OpenMode::WRONLY) || mode.contains(OpenMode::RDWR))
        .create(mode.contains(OpenMode::CREAT))
        .truncate(mode.contains(OpenMode::TRUNC));

    let mut flags = 0;
    if with_direct && (mode.contains(OpenMode::DIRECT) || mode.contains(OpenMode::REQUIRE_DIRECT)) {
        flags |= direct_flag();
    }
    if mode.contains(OpenMode::SYNC) {
        flags |= nix::libc::O_SYNC;
    }
    options.custom_flags(flags);

    options.open(path)
}

#[cfg(target_os = "linux")]
fn direct_flag() -> i32 {
    nix::libc::O_DIRECT
}

/// Platforms without O_DIRECT open buffered; REQUIRE_DIRECT is best-effort
/// there.
#[cfg(not(target_os = "linux"))]
fn direct_flag() -> i32 {
    0
}

fn direct_fallback_applies(error: &std::io::Error, mode: OpenMode) -> bool {
    (mode.contains(OpenMode::DIRECT) || mode.contains(OpenMode::REQUIRE_DIRECT))
        && error.raw_os_error() == Some(nix::libc::EINVAL)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn open_create_size_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.bin");

        let handle = FileHandle::open(&path, OpenMode::RDWR | OpenMode::CREAT).unwrap();
        assert!(!handle.is_device());
        assert_eq!(handle.size().unwrap(), 0);

        handle.file().unwrap().write_all(b"0123456789").unwrap();
        assert_eq!(handle.size().unwrap(), 10);

        handle.set_size(4).unwrap();
        assert_eq!(handle.size().unwrap(), 4);

        handle.unlink().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn readonly_set_size_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, b"abc").unwrap();

        let handle = FileHandle::open(&path, OpenMode::RDONLY).unwrap();
        handle.set_size(0).unwrap();
        assert_eq!(handle.size().unwrap(), 3);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");

        let mut handle = FileHandle::open(&path, OpenMode::WRONLY | OpenMode::CREAT).unwrap();
        handle.close();
        handle.close();
        assert!(handle.file().is_none());
        assert!(handle.size().is_err());
    }

    #[test]
    fn no_lock_allows_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");

        let first = FileHandle::open(&path, OpenMode::RDWR | OpenMode::CREAT | OpenMode::NO_LOCK).unwrap();
        let second = FileHandle::open(&path, OpenMode::RDWR | OpenMode::NO_LOCK).unwrap();
        drop(first);
        drop(second);
    }

    #[test]
    fn truncate_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        std::fs::write(&path, b"leftover").unwrap();

        let handle = FileHandle::open(&path, OpenMode::RDWR | OpenMode::TRUNC).unwrap();
        assert_eq!(handle.size().unwrap(), 0);
    }
}
