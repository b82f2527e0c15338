//! The kernel instance: every global subsystem behind one handle.
//!
//! All mutable kernel state hangs off a [`Kernel`] with a single
//! documented init point ([`Kernel::new`]) and no teardown. Production
//! boot leaks one instance and hands `&'static Kernel` to every CPU;
//! tests build one per scenario the same way.

use core::sync::atomic::AtomicBool;

use crate::console::Console;
use crate::hw::{FrameAlloc, Machine};
use crate::fs::FileSystem;
use crate::proc::{Channel, CpuTable, ProcessTable};
use crate::sched::{self, policy::SchedPolicy};
use crate::swap::queue::SwapQueue;
use crate::swap::SwapStats;
use crate::time::TimeKeeper;

/// The kernel: process table, CPUs, clock, swap machinery, console, and
/// the machine and filesystem collaborators.
pub struct Kernel {
    /// The machine seam.
    pub machine: &'static dyn Machine,
    /// The physical frame allocator.
    pub frames: &'static dyn FrameAlloc,
    /// The filesystem.
    pub fs: &'static dyn FileSystem,
    /// The scheduling policy this kernel runs under.
    pub policy: SchedPolicy,
    /// The process table and its global lock.
    pub ptable: ProcessTable,
    /// Per-CPU state.
    pub cpus: CpuTable,
    /// The tick clock.
    pub time: TimeKeeper,
    /// Swap accounting and quota.
    pub swap: SwapStats,
    /// Swap-out request queue.
    pub swap_out: SwapQueue,
    /// Swap-in request queue.
    pub swap_in: SwapQueue,
    /// Console history and control keys.
    pub console: Console,
    /// Flips on the first `fork_return`; gates one-time init.
    pub(crate) booted: AtomicBool,
}

impl Kernel {
    /// Builds a kernel over its collaborators. The caller leaks the
    /// instance and then brings up CPUs with [`run_cpu`](Self::run_cpu).
    pub fn new(
        machine: &'static dyn Machine,
        frames: &'static dyn FrameAlloc,
        fs: &'static dyn FileSystem,
        policy: SchedPolicy,
    ) -> Self {
        Self {
            machine,
            frames,
            fs,
            policy,
            ptable: ProcessTable::new(),
            cpus: CpuTable::new(),
            time: TimeKeeper::new(),
            swap: SwapStats::new(),
            swap_out: SwapQueue::new("swapout.queue", Channel::SwapOutQueue),
            swap_in: SwapQueue::new("swapin.queue", Channel::SwapInQueue),
            console: Console::new(),
            booted: AtomicBool::new(false),
        }
    }

    /// Runs this CPU's scheduler loop. The caller must be bound to a CPU
    /// (interrupt hooks installed, CPU id assigned) and have created the
    /// first process via [`crate::proc::userinit`].
    ///
    /// Returns only when the machine requests shutdown while this CPU is
    /// idle.
    pub fn run_cpu(&'static self) {
        debug_assert!(
            muon_core::sync::irq::cpu_id() < self.machine.cpu_count(),
            "run_cpu on an unbound thread"
        );
        sched::scheduler(self);
    }
}
