//! In-memory filesystem backed by heap allocations.
//!
//! `RamFs` keeps a flat root directory of byte-vector files behind spin
//! locks. It is the reference [`FileSystem`] implementation: swap files
//! and test fixtures live here. The log-transaction bracket is tracked
//! only as a nesting counter — there is no disk to recover, but the
//! bracket discipline is still asserted.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;

use super::{FileSystem, FsError, Inode};

/// A ramfs instance: one flat root directory.
pub struct RamFs {
    root: Arc<RamInode>,
    entries: SpinLock<BTreeMap<String, Arc<RamInode>>>,
    ops_in_flight: SpinLock<usize>,
}

impl RamFs {
    /// Creates an empty ramfs.
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamInode::new()),
            entries: SpinLock::named("ramfs", BTreeMap::new()),
            ops_in_flight: SpinLock::named("ramfs.log", 0),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn recover(&self) {
        kinfo!("ramfs: nothing to recover");
    }

    fn begin_op(&self) {
        *self.ops_in_flight.lock() += 1;
    }

    fn end_op(&self) {
        let mut ops = self.ops_in_flight.lock();
        assert!(*ops > 0, "ramfs: end_op without begin_op");
        *ops -= 1;
    }

    fn create(&self, path: &str) -> Result<Arc<dyn Inode>, FsError> {
        let path = normalize(path);
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(path) {
            return Ok(existing.clone() as Arc<dyn Inode>);
        }
        let inode = Arc::new(RamInode::new());
        entries.insert(path.to_string(), inode.clone());
        Ok(inode as Arc<dyn Inode>)
    }

    fn open(&self, path: &str) -> Result<Arc<dyn Inode>, FsError> {
        let path = normalize(path);
        let entries = self.entries.lock();
        entries
            .get(path)
            .cloned()
            .map(|inode| inode as Arc<dyn Inode>)
            .ok_or(FsError::NotFound)
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        let mut entries = self.entries.lock();
        entries.remove(path).map(|_| ()).ok_or(FsError::NotFound)
    }

    fn root(&self) -> Arc<dyn Inode> {
        self.root.clone()
    }

    fn readdir(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

/// Strips the root prefix: files live in a flat root directory.
fn normalize(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// A ramfs inode holding its bytes inline.
struct RamInode {
    data: SpinLock<Vec<u8>>,
}

impl RamInode {
    fn new() -> Self {
        Self {
            data: SpinLock::named("ramfs.inode", Vec::new()),
        }
    }
}

impl Inode for RamInode {
    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read() {
        let fs = RamFs::new();
        let inode = fs.create("5_3.swp").unwrap();
        assert_eq!(inode.write_at(0, b"page bytes").unwrap(), 10);

        let again = fs.open("5_3.swp").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(again.read_at(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"page bytes");
    }

    #[test]
    fn create_of_existing_returns_same_file() {
        let fs = RamFs::new();
        let first = fs.create("f").unwrap();
        first.write_at(0, b"abc").unwrap();
        let second = fs.create("f").unwrap();
        assert_eq!(second.size(), 3);
    }

    #[test]
    fn open_missing_fails() {
        let fs = RamFs::new();
        assert!(matches!(fs.open("nope"), Err(FsError::NotFound)));
    }

    #[test]
    fn unlink_removes() {
        let fs = RamFs::new();
        fs.create("gone").unwrap();
        fs.unlink("gone").unwrap();
        assert!(matches!(fs.open("gone"), Err(FsError::NotFound)));
        assert!(matches!(fs.unlink("gone"), Err(FsError::NotFound)));
    }

    #[test]
    fn root_prefix_is_ignored() {
        let fs = RamFs::new();
        fs.create("/7_0.swp").unwrap();
        assert!(fs.open("7_0.swp").is_ok());
        assert_eq!(fs.readdir(), vec!["7_0.swp".to_string()]);
    }

    #[test]
    fn read_past_end_is_eof() {
        let fs = RamFs::new();
        let inode = fs.create("short").unwrap();
        inode.write_at(0, b"xy").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(inode.read_at(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = RamFs::new();
        let inode = fs.create("sparse").unwrap();
        inode.write_at(4, b"z").unwrap();
        let mut buf = [0xffu8; 5];
        assert_eq!(inode.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, &[0, 0, 0, 0, b'z']);
    }

    #[test]
    fn op_bracket_balances() {
        let fs = RamFs::new();
        fs.begin_op();
        fs.begin_op();
        fs.end_op();
        fs.end_op();
    }

    #[test]
    #[should_panic(expected = "end_op without begin_op")]
    fn unbalanced_end_op_panics() {
        let fs = RamFs::new();
        fs.end_op();
    }
}
