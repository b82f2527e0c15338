//! Swap-file naming and page transfer.
//!
//! A swapped page lives in a regular file `<pid>_<vpn>.swp` in the root
//! directory, holding exactly one page of raw bytes. The name alone
//! identifies the backing — the PTE does not store an offset.
//!
//! Files are opened through the caller's own descriptor table: the
//! swap-out daemon keeps the files it writes open (that is what the
//! `file_limit` gauge counts), the swap-in side consumes and deletes
//! them.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use muon_core::id::Pid;
use muon_core::page::{Vpn, PAGE_SIZE};

use crate::error::KernelError;
use crate::fs::File;
use crate::proc::ProcData;
use crate::Kernel;

/// Builds the swap-file name for `(pid, vpn)`: decimal digits, `vpn == 0`
/// encoded literally as `"0"`.
pub fn swap_file_name(pid: Pid, vpn: Vpn) -> String {
    format!("{pid}_{vpn}.swp")
}

/// Writes one page of `bytes` to the swap file for `(pid, vpn)`.
///
/// The file is created through the filesystem transaction and stays open
/// in `owner`'s descriptor table; the quota gauge rises by one.
pub fn write_page(
    kernel: &Kernel,
    owner: &mut ProcData,
    pid: Pid,
    vpn: Vpn,
    bytes: &[u8],
) -> Result<(), KernelError> {
    debug_assert_eq!(bytes.len(), PAGE_SIZE);
    kernel.swap.file_limit.fetch_add(1, Ordering::SeqCst);

    let name = swap_file_name(pid, vpn);
    kernel.fs.begin_op();
    let inode = kernel.fs.create(&name);
    kernel.fs.end_op();
    let inode = match inode {
        Ok(inode) => inode,
        Err(err) => {
            kernel.swap.file_limit.fetch_sub(1, Ordering::SeqCst);
            return Err(err.into());
        }
    };

    let file = Arc::new(File::new(name.clone(), inode, false, true));
    // Re-evicting a page reuses its descriptor slot; a stale handle from
    // an earlier eviction cycle is dropped here.
    let reusable = owner
        .ofile
        .iter_mut()
        .find(|slot| slot.as_ref().is_some_and(|f| f.path() == name));
    match reusable {
        Some(slot) => *slot = Some(file.clone()),
        None => {
            if let Err(err) = owner.fd_alloc(file.clone()) {
                kernel.swap.file_limit.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        }
    }

    let written = file.write(bytes)?;
    if written != PAGE_SIZE {
        kerr!("swap: short write to {name} ({written} bytes)");
        return Err(KernelError::Fs(crate::fs::FsError::IoError));
    }

    kernel.swap.out_count.fetch_add(1, Ordering::SeqCst);
    kdebug!("swap: page {vpn} of pid {pid} saved to {name}");
    Ok(())
}

/// Reads and consumes the swap file for `(pid, vpn)`: the page lands in
/// `buf`, the file is unlinked, and the descriptor is released.
///
/// The quota gauge is the caller's to decrement — the swap-in daemon
/// charges it at dequeue time.
pub fn read_page(
    kernel: &Kernel,
    owner: &mut ProcData,
    pid: Pid,
    vpn: Vpn,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    debug_assert_eq!(buf.len(), PAGE_SIZE);

    let name = swap_file_name(pid, vpn);
    let inode = kernel.fs.open(&name)?;
    let file = Arc::new(File::new(name.clone(), inode, true, false));
    let fd = owner.fd_alloc(file.clone())?;

    let read = file.read(buf);
    owner.ofile[fd.as_usize()] = None;
    let read = read?;
    if read != PAGE_SIZE {
        kerr!("swap: short read from {name} ({read} bytes)");
        return Err(KernelError::Fs(crate::fs::FsError::IoError));
    }

    kernel.swap.in_count.fetch_add(1, Ordering::SeqCst);
    delete_page(kernel, &name)?;
    kdebug!("swap: page {vpn} of pid {pid} restored from {name}");
    Ok(())
}

/// Unlinks a swap file under the filesystem transaction.
pub fn delete_page(kernel: &Kernel, name: &str) -> Result<(), KernelError> {
    kernel.fs.begin_op();
    let result = kernel.fs.unlink(name);
    kernel.fs.end_op();
    result.map_err(Into::into)
}

/// Names of all swap files currently on disk.
pub fn swap_files_on_disk(kernel: &Kernel) -> alloc::vec::Vec<String> {
    kernel
        .fs
        .readdir()
        .into_iter()
        .filter(|name| name.ends_with(".swp"))
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_encoding() {
        assert_eq!(swap_file_name(Pid::new(7), Vpn::new(0)), "7_0.swp");
        assert_eq!(swap_file_name(Pid::new(12), Vpn::new(34)), "12_34.swp");
    }
}
