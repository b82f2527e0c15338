//! Filesystem seam and open-file handles.
//!
//! The kernel core needs only a narrow slice of a filesystem: create,
//! open, read, write, unlink, and the transactional `begin_op`/`end_op`
//! bracket of the log layer. [`FileSystem`] and [`Inode`] name exactly
//! that surface; [`RamFs`](ramfs::RamFs) is the in-tree implementation.
//!
//! An open file is an [`File`] behind an `Arc`: `fork` duplicates handles
//! by cloning the `Arc`, close is the last drop.

pub mod ramfs;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Errors from filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The path does not exist.
    NotFound,
    /// The path already exists.
    AlreadyExists,
    /// The backing store is full.
    NoSpace,
    /// The handle does not permit the operation.
    PermissionDenied,
    /// An I/O error occurred.
    IoError,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::NoSpace => f.write_str("no space"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::IoError => f.write_str("I/O error"),
        }
    }
}

/// A file's data plane.
pub trait Inode: Send + Sync {
    /// Current size in bytes.
    fn size(&self) -> usize;

    /// Reads at `offset` into `buf`, returning bytes read (0 at EOF).
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, extending the file as needed. Returns
    /// bytes written.
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError>;
}

/// The filesystem surface the kernel core calls.
pub trait FileSystem: Sync {
    /// Implementation name for logs.
    fn name(&self) -> &'static str;

    /// Replays the on-disk log after a crash. Run once, from the first
    /// process context (it may sleep).
    fn recover(&self);

    /// Opens a transaction bracket on the log.
    fn begin_op(&self);

    /// Closes the transaction bracket.
    fn end_op(&self);

    /// Creates `path` as an empty file, or opens it if it already exists
    /// as a file.
    fn create(&self, path: &str) -> Result<Arc<dyn Inode>, FsError>;

    /// Opens an existing `path`.
    fn open(&self, path: &str) -> Result<Arc<dyn Inode>, FsError>;

    /// Removes `path`.
    fn unlink(&self, path: &str) -> Result<(), FsError>;

    /// Root-directory inode (processes hold it as their cwd).
    fn root(&self) -> Arc<dyn Inode>;

    /// Names of the root directory's entries.
    fn readdir(&self) -> alloc::vec::Vec<String>;
}

/// An open file: an inode plus a cursor and access mode.
///
/// Shared between descriptor-table slots by `Arc`; the cursor is atomic
/// so duplicated handles advance a common offset.
pub struct File {
    path: String,
    inode: Arc<dyn Inode>,
    offset: AtomicUsize,
    readable: bool,
    writable: bool,
}

impl File {
    /// Wraps `inode` as an open file.
    pub fn new(path: String, inode: Arc<dyn Inode>, readable: bool, writable: bool) -> Self {
        Self {
            path,
            inode,
            offset: AtomicUsize::new(0),
            readable,
            writable,
        }
    }

    /// The path this file was opened under.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads from the cursor, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.readable {
            return Err(FsError::PermissionDenied);
        }
        let offset = self.offset.load(Ordering::Acquire);
        let n = self.inode.read_at(offset, buf)?;
        self.offset.store(offset + n, Ordering::Release);
        Ok(n)
    }

    /// Writes at the cursor, advancing it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }
        let offset = self.offset.load(Ordering::Acquire);
        let n = self.inode.write_at(offset, buf)?;
        self.offset.store(offset + n, Ordering::Release);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::ramfs::RamFs;
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn file_cursor_advances() {
        let fs = RamFs::new();
        let inode = fs.create("cursor").unwrap();
        let file = File::new("cursor".to_string(), inode, true, true);

        assert_eq!(file.write(b"abcdef").unwrap(), 6);
        let mut buf = [0u8; 6];
        // Cursor is past the data we just wrote.
        assert_eq!(file.read(&mut buf).unwrap(), 0);

        let reader = File::new("cursor".to_string(), fs.open("cursor").unwrap(), true, false);
        assert_eq!(reader.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn mode_is_enforced() {
        let fs = RamFs::new();
        let inode = fs.create("ro").unwrap();
        let file = File::new("ro".to_string(), inode, true, false);
        assert_eq!(file.write(b"x"), Err(FsError::PermissionDenied));
    }
}
