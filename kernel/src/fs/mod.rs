//! The slice of the file system the VM depends on.
//!
//! Page-in reads, eviction write-backs and the mmap bookkeeping all go through
//! [`File`] while holding [`FILESYS_LOCK`], the same lock the read/write
//! system calls take, so VM traffic never interleaves with explicit file I/O.

pub mod memfile;

use crate::sync::Mutex;
use alloc::sync::Arc;
use kidneyos_syscalls::{EBADF, EIO};

pub type FileDescriptor = i16;

/// Serializes all file content I/O in the kernel.
pub static FILESYS_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` while holding [`FILESYS_LOCK`].
pub fn with_file_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = FILESYS_LOCK.lock();
    f()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// the device under the file failed
    Io,
    /// descriptor does not name an open file
    BadFileDescriptor,
    /// handle was already closed
    Closed,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io => write!(f, "input/output error"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::Closed => write!(f, "file handle is closed"),
        }
    }
}

impl core::error::Error for Error {}

impl Error {
    pub fn to_isize(self) -> isize {
        match self {
            Self::Io => EIO,
            Self::BadFileDescriptor | Self::Closed => EBADF,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file handle.
///
/// Offsets are absolute; handles keep no cursor. Callers are expected to hold
/// [`FILESYS_LOCK`] around every call.
pub trait File: Send + Sync + core::fmt::Debug {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`. Files do not grow: the count
    /// is short when the write runs past the end.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    fn length(&self) -> u64;

    /// Open an independent handle to the same file. Closing either handle
    /// leaves the other usable.
    fn reopen(&self) -> Result<Arc<dyn File>>;

    fn close(&self);
}
