//! User-memory operations over the machine seam.
//!
//! Growth, shrink, fork's page-by-page copy, and the user/kernel copy
//! helpers. All frame allocation funnels through
//! [`alloc_frame_blocking`], which queues behind the swap-out daemon
//! instead of failing when physical memory runs dry — that back-pressure
//! is what lets `sbrk` and `fork` succeed under frame pressure.

use alloc::boxed::Box;

use muon_core::id::Pid;
use muon_core::page::{Frame, Pte, PteFlags, Vpn, PAGE_SIZE};

use crate::error::KernelError;
use crate::hw::VmSpace;
use crate::proc::ProcData;
use crate::{swap, Kernel};

/// Rounds `bytes` up to whole pages.
pub fn page_count(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Allocates a physical frame, queueing a swap-out request and retrying
/// whenever the pool is empty.
///
/// Must be called from process context with no spin lock held: the
/// retry path sleeps.
pub(crate) fn alloc_frame_blocking(kernel: &'static Kernel) -> Frame {
    loop {
        if let Some(frame) = kernel.frames.alloc_frame() {
            return frame;
        }
        swap::daemon::request_swap_out(kernel);
    }
}

/// Grows the address space in `data` from `old_sz` to `new_sz` bytes,
/// mapping zeroed pages. Returns the new size.
///
/// Page 0 is never mapped; user memory starts at the second page.
pub fn uvm_alloc(
    kernel: &'static Kernel,
    data: &mut ProcData,
    old_sz: usize,
    new_sz: usize,
) -> Result<usize, KernelError> {
    if new_sz <= old_sz {
        return Ok(old_sz);
    }
    for n in page_count(old_sz)..page_count(new_sz) {
        let frame = alloc_frame_blocking(kernel);
        // SAFETY: the frame was just allocated; nothing references it.
        unsafe { core::ptr::write_bytes(kernel.frames.frame_bytes(frame), 0, PAGE_SIZE) };
        let vm = data.vm.as_mut().ok_or(KernelError::BadAddress)?;
        vm.map(
            Vpn::new(n),
            frame,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        );
    }
    Ok(new_sz)
}

/// Shrinks the address space in `data` from `old_sz` to `new_sz` bytes,
/// unmapping and freeing the dropped pages. Returns the new size.
pub fn uvm_dealloc(
    kernel: &Kernel,
    data: &mut ProcData,
    old_sz: usize,
    new_sz: usize,
) -> usize {
    let Some(vm) = data.vm.as_mut() else {
        return new_sz;
    };
    for n in page_count(new_sz)..page_count(old_sz) {
        if let Some(pte) = vm.unmap(Vpn::new(n)) {
            if pte.is_present() {
                kernel.frames.free_frame(pte.frame());
            }
            // A swapped page's file lingers until the purge pass.
        }
    }
    new_sz
}

/// Builds a copy of `parent`'s address space for a forked child.
///
/// Pages are copied one by one. A page that is currently swapped out is
/// first restored from its swap file (fork runs in process context with
/// no spin lock held, so the file I/O is legal) and left resident in the
/// parent.
pub fn uvm_copy(
    kernel: &'static Kernel,
    parent: &mut ProcData,
    parent_pid: Pid,
) -> Result<Box<dyn VmSpace>, KernelError> {
    let mut child = kernel.machine.create_space();
    let sz = parent.sz;

    for n in 1..page_count(sz) {
        let vpn = Vpn::new(n);
        let Some(pte) = parent.vm.as_ref().ok_or(KernelError::BadAddress)?.pte(vpn) else {
            continue;
        };

        let pte = if pte.is_swapped() {
            restore_page(kernel, parent, parent_pid, vpn, pte)?
        } else if pte.is_present() {
            pte
        } else {
            continue;
        };

        let dst = alloc_frame_blocking(kernel);
        // SAFETY: the source frame is pinned by the parent's mapping (the
        // parent is the caller), the destination was just allocated.
        unsafe {
            core::ptr::copy_nonoverlapping(
                kernel.frames.frame_bytes(pte.frame()),
                kernel.frames.frame_bytes(dst),
                PAGE_SIZE,
            );
        }
        child.map(vpn, dst, pte.flags() & (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
    }
    Ok(child)
}

/// Brings a swapped-out page of the caller's own space back into memory.
fn restore_page(
    kernel: &'static Kernel,
    data: &mut ProcData,
    pid: Pid,
    vpn: Vpn,
    old: Pte,
) -> Result<Pte, KernelError> {
    let frame = alloc_frame_blocking(kernel);
    {
        // SAFETY: the frame was just allocated; nothing references it.
        let buf =
            unsafe { core::slice::from_raw_parts_mut(kernel.frames.frame_bytes(frame), PAGE_SIZE) };
        swap::codec::read_page(kernel, data, pid, vpn, buf)?;
    }
    kernel
        .swap
        .file_limit
        .fetch_sub(1, core::sync::atomic::Ordering::SeqCst);
    let restored = Pte::new(
        frame,
        (old.flags().difference(PteFlags::SWAPPED)) | PteFlags::PRESENT,
    );
    let vm = data.vm.as_mut().ok_or(KernelError::BadAddress)?;
    vm.set_pte(vpn, restored);
    Ok(restored)
}

/// Frees every resident frame of `space`, which covered `sz` bytes.
pub fn free_space(kernel: &Kernel, mut space: Box<dyn VmSpace>, sz: usize) {
    for n in 0..page_count(sz) {
        if let Some(pte) = space.unmap(Vpn::new(n)) {
            if pte.is_present() {
                kernel.frames.free_frame(pte.frame());
            }
        }
    }
}

/// Copies `src` into the caller's user memory at `va`, faulting swapped
/// pages back in as needed. The hardware accessed and dirty bits are set
/// as a real walker would.
pub fn copy_out(
    kernel: &'static Kernel,
    data: &mut ProcData,
    va: usize,
    src: &[u8],
) -> Result<(), KernelError> {
    if va.checked_add(src.len()).map_or(true, |end| end > data.sz) {
        return Err(KernelError::BadAddress);
    }
    let mut copied = 0;
    while copied < src.len() {
        let at = va + copied;
        let vpn = Vpn::containing(at);
        let offset = at - vpn.base();
        let n = (PAGE_SIZE - offset).min(src.len() - copied);
        let frame = resident_frame(kernel, data, vpn, true)?;
        // SAFETY: the frame is mapped by the caller's own space.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src[copied..].as_ptr(),
                kernel.frames.frame_bytes(frame).add(offset),
                n,
            );
        }
        copied += n;
    }
    Ok(())
}

/// Copies from the caller's user memory at `va` into `dst`, faulting
/// swapped pages back in as needed.
pub fn copy_in(
    kernel: &'static Kernel,
    data: &mut ProcData,
    va: usize,
    dst: &mut [u8],
) -> Result<(), KernelError> {
    if va.checked_add(dst.len()).map_or(true, |end| end > data.sz) {
        return Err(KernelError::BadAddress);
    }
    let mut copied = 0;
    while copied < dst.len() {
        let at = va + copied;
        let vpn = Vpn::containing(at);
        let offset = at - vpn.base();
        let n = (PAGE_SIZE - offset).min(dst.len() - copied);
        let frame = resident_frame(kernel, data, vpn, false)?;
        // SAFETY: the frame is mapped by the caller's own space.
        unsafe {
            core::ptr::copy_nonoverlapping(
                kernel.frames.frame_bytes(frame).add(offset),
                dst[copied..].as_mut_ptr(),
                n,
            );
        }
        copied += n;
    }
    Ok(())
}

/// Resolves `vpn` in the caller's space to a resident frame, going
/// through the swap-in fault path when the page is on disk. Updates the
/// accessed (and, for writes, dirty) bits the way hardware would.
fn resident_frame(
    kernel: &'static Kernel,
    data: &mut ProcData,
    vpn: Vpn,
    write: bool,
) -> Result<Frame, KernelError> {
    loop {
        let vm = data.vm.as_mut().ok_or(KernelError::BadAddress)?;
        match vm.pte(vpn) {
            Some(pte) if pte.is_present() && pte.is_user() => {
                let mut touched = pte.with_flags(PteFlags::ACCESSED);
                if write {
                    touched = touched.with_flags(PteFlags::DIRTY);
                }
                vm.set_pte(vpn, touched);
                return Ok(pte.frame());
            }
            Some(pte) if pte.is_swapped() => {
                // Page-not-present with the swapped bit set: block until
                // the swap-in daemon restores it, then retry.
                swap::daemon::handle_page_fault(kernel, vpn.base());
            }
            _ => return Err(KernelError::BadAddress),
        }
    }
}
