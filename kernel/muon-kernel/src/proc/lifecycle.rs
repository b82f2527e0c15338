//! Process lifecycle operations: fork, exit, wait, growth, priorities.

use alloc::boxed::Box;

use muon_core::id::Pid;

use super::{allocproc, current_slot, sleep, Channel, ProcState, ProcStats};
use crate::config::NPROC;
use crate::error::KernelError;
use crate::hw::{Context, TrapFrame};
use crate::{sched, swap, vm, Kernel};

/// Creates a new process copying the caller.
///
/// The child gets a page-by-page copy of the address space, duplicated
/// file handles and cwd, a copy of the trap frame with the syscall-return
/// register cleared (so it observes 0 from `fork`), and the parent's
/// priority. Returns the child's pid to the parent.
pub fn fork(kernel: &'static Kernel) -> Result<Pid, KernelError> {
    let parent_idx = current_slot(kernel).expect("fork without a process");
    // SAFETY: the caller's own data.
    let parent_data = unsafe { kernel.ptable.slot(parent_idx).data_mut() };
    let parent_pid = kernel.ptable.lock.lock().procs[parent_idx].pid;

    let (child_idx, child_pid) = allocproc(kernel, Box::new(move || sched::fork_return(kernel)))?;
    // SAFETY: EMBRYO slot under construction by this caller.
    let child_data = unsafe { kernel.ptable.slot(child_idx).data_mut() };

    match vm::uvm_copy(kernel, parent_data, parent_pid) {
        Ok(space) => child_data.vm = Some(space),
        Err(err) => {
            if let Some(stack) = child_data.kstack.take() {
                kernel.machine.free_kstack(stack);
            }
            kernel.machine.retire_context(&child_data.context);
            child_data.context = Context::zeroed();
            kernel.ptable.lock.lock().procs[child_idx].rollback();
            return Err(err);
        }
    }

    child_data.sz = parent_data.sz;
    child_data.tf = parent_data.tf.clone();
    child_data.tf.retval = 0;
    for (i, file) in parent_data.ofile.iter().enumerate() {
        child_data.ofile[i] = file.clone();
    }
    child_data.cwd = parent_data.cwd.clone();
    child_data.name = parent_data.name.clone();

    let mut table = kernel.ptable.lock.lock();
    let inherited = table.procs[parent_idx].priority;
    table.procs[child_idx].parent = Some(parent_idx);
    table.procs[child_idx].priority = inherited;
    table.procs[child_idx].state = ProcState::Runnable;
    Ok(child_pid)
}

/// Exits the current process. Does not return.
///
/// Closes open files, releases the cwd under the filesystem transaction,
/// wakes the parent, hands orphans to init, and parks as a ZOMBIE until
/// the parent reaps it.
///
/// # Panics
///
/// Panics if init exits.
pub fn exit(kernel: &'static Kernel) -> ! {
    let idx = current_slot(kernel).expect("exit without a process");
    {
        let table = kernel.ptable.lock.lock();
        assert_ne!(table.init_slot, Some(idx), "init exiting");
    }

    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    for file in data.ofile.iter_mut() {
        *file = None;
    }

    // A foreground job finishing is the point where stale swap files are
    // reclaimed from the swap daemons.
    if parent_is_shell(kernel, idx) {
        swap::daemon::purge_swap_files(kernel);
    }

    kernel.fs.begin_op();
    data.cwd = None;
    kernel.fs.end_op();

    let mut table = kernel.ptable.lock.lock();

    // Parent might be sleeping in wait.
    if let Some(parent_idx) = table.procs[idx].parent {
        sleep::wakeup_locked(kernel, &mut table, Channel::Proc(parent_idx));
    }

    // Pass abandoned children to init.
    let init_slot = table.init_slot.expect("exit before init");
    for i in 0..NPROC {
        if table.procs[i].parent == Some(idx) {
            table.procs[i].parent = Some(init_slot);
            if table.procs[i].state == ProcState::Zombie {
                sleep::wakeup_locked(kernel, &mut table, Channel::Proc(init_slot));
            }
        }
    }

    // Into the scheduler, never to return.
    table.procs[idx].state = ProcState::Zombie;
    let _table = sched::sched(kernel, table);
    panic!("zombie exit");
}

/// Whether the caller's parent is the shell, found by name.
fn parent_is_shell(kernel: &Kernel, idx: usize) -> bool {
    let parent = kernel.ptable.lock.lock().procs[idx].parent;
    let Some(parent_idx) = parent else {
        return false;
    };
    // SAFETY: a name is written once while the slot is EMBRYO and stable
    // afterwards; this is a read-only peek.
    let parent_data = unsafe { kernel.ptable.slot(parent_idx).data_mut() };
    parent_data.name == "sh"
}

/// Waits for a child to exit and reaps it, returning its pid.
///
/// Returns [`KernelError::NoChildren`] when the caller has no children
/// and [`KernelError::Killed`] when the caller was killed while waiting.
pub fn wait(kernel: &'static Kernel) -> Result<Pid, KernelError> {
    wait_inner(kernel).map(|(pid, _)| pid)
}

/// [`wait`], additionally capturing the child's timing counters.
pub fn waitstats(kernel: &'static Kernel) -> Result<(Pid, ProcStats), KernelError> {
    wait_inner(kernel)
}

fn wait_inner(kernel: &'static Kernel) -> Result<(Pid, ProcStats), KernelError> {
    let me = current_slot(kernel).expect("wait without a process");
    let mut table = kernel.ptable.lock.lock();
    loop {
        let mut have_kids = false;
        for i in 0..NPROC {
            if table.procs[i].parent != Some(me) {
                continue;
            }
            have_kids = true;
            if table.procs[i].state != ProcState::Zombie {
                continue;
            }

            // Found one: free everything and zero the slot.
            let pid = table.procs[i].pid;
            let stats = table.procs[i].stats();
            // SAFETY: a ZOMBIE is off-CPU for good and we are its reaper.
            let data = unsafe { kernel.ptable.slot(i).data_mut() };
            if let Some(stack) = data.kstack.take() {
                kernel.machine.free_kstack(stack);
            }
            if let Some(space) = data.vm.take() {
                vm::free_space(kernel, space, data.sz);
            }
            kernel.machine.retire_context(&data.context);
            data.context = Context::zeroed();
            data.tf = TrapFrame::default();
            data.name.clear();
            data.sz = 0;
            data.trapva = 0;
            table.procs[i].rollback();
            return Ok((pid, stats));
        }

        if !have_kids {
            return Err(KernelError::NoChildren);
        }
        if table.procs[me].killed {
            return Err(KernelError::Killed);
        }

        // Wait for a child to exit (see the wakeup in `exit`).
        table = sleep::sleep_on(kernel, Channel::Proc(me), table);
    }
}

/// Grows or shrinks the caller's memory by `delta` bytes and reloads the
/// address space. Returns the previous size (the `sbrk` return value).
pub fn growproc(kernel: &'static Kernel, delta: isize) -> Result<usize, KernelError> {
    let idx = current_slot(kernel).expect("growproc without a process");
    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    let old_sz = data.sz;

    let new_sz = if delta >= 0 {
        vm::uvm_alloc(kernel, data, old_sz, old_sz + delta as usize)?
    } else {
        let shrink = delta.unsigned_abs();
        if shrink > old_sz {
            return Err(KernelError::InvalidArgument);
        }
        vm::uvm_dealloc(kernel, data, old_sz, old_sz - shrink)
    };

    data.sz = new_sz;
    kernel.machine.switch_address_space(data.vm.as_deref());
    Ok(old_sz)
}

/// Sets the caller's priority to `priority ∈ 1..=3`.
pub fn set_prio(kernel: &Kernel, priority: i64) -> Result<(), KernelError> {
    if !(1..=3).contains(&priority) {
        return Err(KernelError::InvalidArgument);
    }
    let idx = current_slot(kernel).expect("set_prio without a process");
    kernel.ptable.lock.lock().procs[idx].priority = priority as u8;
    Ok(())
}

/// Drops the caller's priority by one level, clamped at 1. The dynamic
/// multilevel timer path calls this on quantum expiry.
pub fn dec_prio(kernel: &Kernel) {
    let Some(idx) = current_slot(kernel) else {
        return;
    };
    let mut table = kernel.ptable.lock.lock();
    let shared = &mut table.procs[idx];
    if shared.priority > 1 {
        shared.priority -= 1;
    }
}
