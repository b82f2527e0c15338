//! Channel-based blocking: sleep, wakeup, kill.
//!
//! A sleeper commits to SLEEPING while holding the table lock and only
//! then switches away; a waker scans the table while holding the same
//! lock. That single lock makes the "release condition lock, then block"
//! step atomic with respect to every waker, so no wakeup can be lost.

use muon_core::id::Pid;
use muon_core::sync::SpinLockGuard;

use super::{current_slot, Channel, ProcState, TableGuard, TableShared};
use crate::error::KernelError;
use crate::sched;
use crate::sched::policy::SchedPolicy;
use crate::Kernel;

/// Blocks the current process on `chan`, releasing `cond` for the
/// duration and re-acquiring it before returning.
///
/// `cond` must not be the process-table lock — callers already holding
/// the table lock use [`sleep_on`] instead.
pub fn sleep<'a, T>(
    kernel: &'static Kernel,
    chan: Channel,
    cond: SpinLockGuard<'a, T>,
) -> SpinLockGuard<'a, T> {
    let cond_lock = cond.lock_ref();

    // Acquire the table lock before releasing the condition lock: once we
    // hold it, no waker can scan past us, so the wakeup cannot slip into
    // the gap.
    let table = kernel.ptable.lock.lock();
    drop(cond);

    let table = sleep_on(kernel, chan, table);
    drop(table);

    cond_lock.lock()
}

/// Blocks the current process on `chan` while already holding the table
/// lock. Returns with the lock re-held.
pub fn sleep_on(kernel: &'static Kernel, chan: Channel, mut table: TableGuard) -> TableGuard {
    let idx = current_slot(kernel).expect("sleep without a process");

    table.procs[idx].chan = Some(chan);
    table.procs[idx].state = ProcState::Sleeping;

    let mut table = sched::sched(kernel, table);

    // Woken (or killed): clear the channel.
    table.procs[idx].chan = None;
    table
}

/// Wakes every process sleeping on `chan`. The table lock must be held.
///
/// Under the dynamic-multilevel policy a wake from sleep also restores
/// the process to the highest priority.
pub fn wakeup_locked(kernel: &Kernel, table: &mut TableShared, chan: Channel) {
    for shared in table.procs.iter_mut() {
        if shared.state == ProcState::Sleeping && shared.chan == Some(chan) {
            shared.state = ProcState::Runnable;
            if kernel.policy == SchedPolicy::Dml {
                shared.priority = 3;
            }
        }
    }
}

/// Wakes every process sleeping on `chan`.
pub fn wakeup(kernel: &Kernel, chan: Channel) {
    let mut table = kernel.ptable.lock.lock();
    wakeup_locked(kernel, &mut table, chan);
}

/// Marks the process with `pid` killed.
///
/// The flag is sticky; the victim exits at its next return to user mode
/// or killed-aware blocking point. A sleeping victim is forced RUNNABLE
/// so it observes the flag promptly.
pub fn kill(kernel: &Kernel, pid: Pid) -> Result<(), KernelError> {
    let mut table = kernel.ptable.lock.lock();
    for shared in table.procs.iter_mut() {
        if shared.pid == pid && shared.state != ProcState::Unused {
            shared.killed = true;
            if shared.state == ProcState::Sleeping {
                shared.state = ProcState::Runnable;
            }
            return Ok(());
        }
    }
    Err(KernelError::NoSuchProcess)
}
