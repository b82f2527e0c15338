//! The per-CPU scheduler loop and the cooperative switch into it.
//!
//! Each CPU runs [`scheduler`] forever in its own context: pick a
//! RUNNABLE slot under the table lock, switch into it with the lock still
//! held, and expect the process to eventually switch back the same way.
//! Lock acquisitions and releases pair *across* the switch: the
//! scheduler's acquisition is released by the dispatched process, and the
//! process's re-acquisition is released by the scheduler after control
//! returns. [`sched`] is the process-side half; [`timer_tick`] is the
//! trap path that enforces quanta and drives the bookkeeper.

pub mod policy;

use core::sync::atomic::Ordering;

use muon_core::sync::irq;

use self::policy::SchedPolicy;
use crate::config::{NPROC, QUANTUM};
use crate::hw::Context;
use crate::proc::lifecycle;
use crate::proc::{current_slot, sleep, Channel, ProcState, TableGuard};
use crate::{swap, time, Kernel};

/// The per-CPU scheduler loop.
///
/// Runs until the machine requests shutdown while the CPU is idle. The
/// caller must already be bound to a CPU with interrupts disabled.
pub fn scheduler(kernel: &'static Kernel) {
    let mut cursors = policy::Cursors::default();

    loop {
        // Let pending interrupts in before going for the lock.
        irq::enable();

        let mut table = kernel.ptable.lock.lock();
        let mut dispatched = false;

        match kernel.policy {
            SchedPolicy::RoundRobin => {
                // One pass over the table, dispatching every RUNNABLE in
                // slot order; the timer enforces the quantum.
                for idx in 0..NPROC {
                    if table.procs[idx].state == ProcState::Runnable {
                        dispatch(kernel, &mut table, idx);
                        dispatched = true;
                    }
                }
            }
            SchedPolicy::Fcfs => {
                if let Some(idx) = policy::select_fcfs(&table) {
                    dispatch(kernel, &mut table, idx);
                    dispatched = true;
                }
            }
            SchedPolicy::Sml | SchedPolicy::Dml => {
                if let Some(idx) = policy::select_max_prio(&table, &mut cursors) {
                    dispatch(kernel, &mut table, idx);
                    dispatched = true;
                }
            }
        }

        drop(table);

        if !dispatched {
            if kernel.machine.shutdown_requested() {
                return;
            }
            kernel.machine.wait_for_interrupt();
        }
    }
}

/// Switches this CPU into the process in slot `idx`.
///
/// The table lock stays held across the switch; the dispatched process
/// releases it. When the process eventually switches back, the lock is
/// held again (re-acquired by the process) and this CPU goes back to
/// selecting.
fn dispatch(kernel: &'static Kernel, table: &mut TableGuard, idx: usize) {
    // SAFETY: interrupts are off while the table lock is held.
    let cpu = unsafe { kernel.cpus.current() };
    cpu.current = Some(idx);

    // SAFETY: a RUNNABLE slot cannot run anywhere else while we hold the
    // table lock, and we are about to make it ours.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    kernel.machine.switch_address_space(data.vm.as_deref());

    table.procs[idx].state = ProcState::Running;
    table.procs[idx].ticks_elapsed = 0;

    // SAFETY: both contexts are live; the process context holds a
    // suspended (or fresh) execution.
    unsafe {
        kernel
            .machine
            .context_switch(&mut cpu.scheduler_ctx, &data.context);
    }

    // The process is done for now; it changed its own state before
    // coming back.
    kernel.machine.switch_address_space(None);
    // SAFETY: interrupts are off again — the process re-acquired the
    // table lock before switching back.
    let cpu = unsafe { kernel.cpus.current() };
    cpu.current = None;
}

/// Switches from the current process back into this CPU's scheduler.
///
/// The caller must hold the table lock exactly once (and no other lock),
/// with its state already moved out of RUNNING; interrupts must be
/// disabled. The interrupt-enable shadow is saved and restored around
/// the switch because it belongs to this kernel thread, not the CPU.
pub(crate) fn sched(kernel: &'static Kernel, table: TableGuard) -> TableGuard {
    assert!(kernel.ptable.lock.holding(), "sched ptable lock");
    assert_eq!(irq::depth(), 1, "sched locks");
    assert!(!irq::enabled(), "sched interruptible");

    // SAFETY: interrupts are off.
    let cpu = unsafe { kernel.cpus.current() };
    let idx = cpu.current.expect("sched without a process");
    assert_ne!(table.procs[idx].state, ProcState::Running, "sched running");

    let intena = irq::snapshot();
    let scheduler_ctx: *const Context = &cpu.scheduler_ctx;
    // SAFETY: the current slot's data belongs to this context; the
    // scheduler context is live in this CPU's table entry.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    unsafe {
        kernel
            .machine
            .context_switch(&mut data.context, scheduler_ctx);
    }
    irq::restore(intena);

    table
}

/// Gives up the CPU for one scheduling round.
pub fn yield_cpu(kernel: &'static Kernel) {
    let mut table = kernel.ptable.lock.lock();
    let idx = current_slot(kernel).expect("yield without a process");
    table.procs[idx].state = ProcState::Runnable;
    let table = sched(kernel, table);
    drop(table);
}

/// First code a freshly allocated process runs.
///
/// Releases the table lock held across the switch by the scheduler. The
/// very first process additionally runs the initialisation that must
/// happen in process context: filesystem log recovery and spawning the
/// swap daemons. Then returns to user mode.
pub(crate) fn fork_return(kernel: &'static Kernel) -> ! {
    // Still holding the table lock from the scheduler.
    // SAFETY: that acquisition belongs to this context now.
    drop(unsafe { kernel.ptable.lock.adopt() });

    if !kernel.booted.swap(true, Ordering::AcqRel) {
        kernel.fs.recover();
        swap::daemon::spawn_daemons(kernel);
    }

    trap_return(kernel)
}

/// Returns to user mode: runs the process's user image, and exits the
/// process when the image finishes (or when it was killed).
fn trap_return(kernel: &'static Kernel) -> ! {
    let idx = current_slot(kernel).expect("trap_return without a process");

    {
        let table = kernel.ptable.lock.lock();
        if table.procs[idx].killed {
            drop(table);
            lifecycle::exit(kernel);
        }
    }

    // SAFETY: the current slot's data belongs to this context.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    let image = data.tf.image.clone();
    let retval = data.tf.retval;

    if let Some(image) = image {
        (*image)(kernel, retval);
    }

    // The user payload ran to completion (or there was none).
    lifecycle::exit(kernel)
}

/// The timer-interrupt path.
///
/// CPU 0 advances the clock, wakes tick sleepers, and runs the per-tick
/// bookkeeper. Every CPU then charges the tick to its running process
/// and enforces the quantum: on expiry the process yields — unless the
/// policy is FCFS, which never preempts — and under the dynamic
/// multilevel policy the expiry also costs one priority level.
pub fn timer_tick(kernel: &'static Kernel) {
    if irq::cpu_id() == 0 {
        kernel.time.advance();
        // Account the tick before waking tick sleepers, so a full tick
        // spent asleep lands in stime rather than retime.
        time::update_stats(kernel);
        sleep::wakeup(kernel, Channel::Ticks);
    }

    let Some(idx) = current_slot(kernel) else {
        return;
    };

    let (killed, elapsed) = {
        let mut table = kernel.ptable.lock.lock();
        table.procs[idx].ticks_elapsed += 1;
        (table.procs[idx].killed, table.procs[idx].ticks_elapsed)
    };

    if killed {
        lifecycle::exit(kernel);
    }
    if elapsed < QUANTUM {
        return;
    }

    match kernel.policy {
        SchedPolicy::Fcfs => {}
        SchedPolicy::Dml => {
            lifecycle::dec_prio(kernel);
            yield_cpu(kernel);
        }
        SchedPolicy::RoundRobin | SchedPolicy::Sml => yield_cpu(kernel),
    }
}
