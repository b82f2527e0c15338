//! The process table and per-CPU state.
//!
//! One fixed array of `NPROC` slots. Each slot is split along the access
//! rule that governs it:
//!
//! - [`ProcShared`] — scheduling state, guarded by the single global
//!   table lock. Any CPU may read or write any slot's shared half while
//!   holding the lock.
//! - [`ProcData`] — the owning context's private half (stacks, address
//!   space, open files). Accessed without the lock, but only by the
//!   context that owns the slot — or by another context that can prove
//!   the slot quiescent (a reaper holding a ZOMBIE, a daemon holding a
//!   victim it forced asleep).
//!
//! The table lock is also the scheduler's lock: it is held across the
//! context switch into a process, and every state transition and channel
//! wakeup linearizes through it.

pub mod lifecycle;
pub mod sleep;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;

use muon_core::id::{Fd, Pid};
use muon_core::page::PAGE_SIZE;
use muon_core::sync::{irq, SpinLock, SpinLockGuard};

use crate::config::{DUMP_PCS, NCPU, NOFILE, NPROC};
use crate::error::KernelError;
use crate::fs::{File, Inode};
use crate::hw::{Context, KernelStack, TrapFrame, UserImage, VmSpace};
use crate::{sched, Kernel};

/// Guard for the process-table lock. The kernel lives for the program, so
/// every guard is `'static`.
pub type TableGuard = SpinLockGuard<'static, TableShared>;

/// The six lifecycle states of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Free slot.
    Unused,
    /// Being constructed; not yet schedulable.
    Embryo,
    /// Blocked on a channel.
    Sleeping,
    /// Ready to run.
    Runnable,
    /// On a CPU right now.
    Running,
    /// Exited, awaiting reap by the parent.
    Zombie,
}

impl ProcState {
    /// Fixed-width state name for the debug dump.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Embryo => "embryo",
            Self::Sleeping => "sleep ",
            Self::Runnable => "runble",
            Self::Running => "run   ",
            Self::Zombie => "zombie",
        }
    }
}

/// An opaque rendezvous token for sleep/wakeup.
///
/// Anything unique will do; the variants enumerate every token the kernel
/// actually uses. A sleeper records its channel, a waker scans for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A process slot's address: `wait` sleeps on its own slot, `exit`
    /// wakes the parent's.
    Proc(usize),
    /// A pid as a token: swap-in requesters sleep here.
    Pid(Pid),
    /// The tick clock.
    Ticks,
    /// Swap-out daemon's "queue non-empty" channel.
    SwapOutQueue,
    /// Swap-out requesters' "request completed" channel.
    SwapOutDone,
    /// Swap-in daemon's "queue non-empty" channel.
    SwapInQueue,
}

/// Timing counters captured for `wait2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStats {
    /// Ticks observed RUNNABLE.
    pub retime: u64,
    /// Ticks observed RUNNING.
    pub rutime: u64,
    /// Ticks observed SLEEPING.
    pub stime: u64,
    /// Tick of creation.
    pub ctime: u64,
}

/// The table-lock-guarded half of a process slot.
#[derive(Debug)]
pub struct ProcShared {
    /// Lifecycle state.
    pub state: ProcState,
    /// Process id; [`Pid::NONE`] while the slot is unused.
    pub pid: Pid,
    /// Parent slot index. Weak back-reference: a child's slot outlives
    /// its parent only through reparenting to init.
    pub parent: Option<usize>,
    /// Channel this slot sleeps on; `Some` iff SLEEPING (except a swap
    /// victim, which is parked on no channel at all).
    pub chan: Option<Channel>,
    /// Sticky kill flag, observed at blocking points and return-to-user.
    pub killed: bool,
    /// Scheduling priority, 1..=3 (3 highest).
    pub priority: u8,
    /// Consecutive ticks in RUNNING since last dispatch.
    pub ticks_elapsed: u32,
    /// Tick of creation.
    pub ctime: u64,
    /// Ticks observed RUNNABLE.
    pub retime: u64,
    /// Ticks observed RUNNING.
    pub rutime: u64,
    /// Ticks observed SLEEPING.
    pub stime: u64,
    /// Set by the swap-out daemon when this slot's request is done.
    pub satisfied: bool,
    /// Kernel thread: never a swap victim, skipped in purge scans.
    pub kthread: bool,
}

impl ProcShared {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            pid: Pid::NONE,
            parent: None,
            chan: None,
            killed: false,
            priority: 0,
            ticks_elapsed: 0,
            ctime: 0,
            retime: 0,
            rutime: 0,
            stime: 0,
            satisfied: false,
            kthread: false,
        }
    }

    /// Returns the slot to UNUSED with every field zeroed, restoring the
    /// invariant `UNUSED ⇔ pid == 0`.
    pub fn rollback(&mut self) {
        *self = Self::new();
    }

    /// Snapshot of the timing counters.
    pub fn stats(&self) -> ProcStats {
        ProcStats {
            retime: self.retime,
            rutime: self.rutime,
            stime: self.stime,
            ctime: self.ctime,
        }
    }
}

/// The owner-private half of a process slot.
pub struct ProcData {
    /// Short printable name.
    pub name: String,
    /// Virtual size in bytes, page-multiple.
    pub sz: usize,
    /// Kernel stack; `None` iff the slot is unused.
    pub kstack: Option<KernelStack>,
    /// User address space; `None` for kernel threads.
    pub vm: Option<Box<dyn VmSpace>>,
    /// Saved user registers, at the top of the kernel stack.
    pub tf: TrapFrame,
    /// Saved callee-context for `swtch`.
    pub context: Context,
    /// Open files, index = descriptor.
    pub ofile: [Option<Arc<File>>; NOFILE],
    /// Current directory.
    pub cwd: Option<Arc<dyn Inode>>,
    /// Faulting virtual address captured for swap-in.
    pub trapva: usize,
}

impl ProcData {
    fn new() -> Self {
        Self {
            name: String::new(),
            sz: 0,
            kstack: None,
            vm: None,
            tf: TrapFrame::default(),
            context: Context::zeroed(),
            ofile: core::array::from_fn(|_| None),
            cwd: None,
            trapva: 0,
        }
    }

    /// Installs `file` in the lowest free descriptor slot.
    pub fn fd_alloc(&mut self, file: Arc<File>) -> Result<Fd, KernelError> {
        for (i, slot) in self.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(Fd::new(i as u32));
            }
        }
        Err(KernelError::OutOfDescriptors)
    }
}

/// One process-table slot.
pub struct Process {
    /// Slot index, fixed for the table's lifetime.
    pub idx: usize,
    data: UnsafeCell<ProcData>,
}

// SAFETY: access to `data` is governed by the quiescence discipline
// documented on `data_mut`; the shared half is behind the table lock.
unsafe impl Sync for Process {}

impl Process {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    /// Returns the slot's private data.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the slot. That holds
    /// when any of:
    /// - the caller is the context currently running this slot;
    /// - the slot is EMBRYO and the caller is constructing it;
    /// - the slot is ZOMBIE and the caller is its reaper;
    /// - the slot is provably off-CPU and unwakeable (a swap victim
    ///   forced SLEEPING on no channel, or any non-RUNNING slot while
    ///   the caller holds the table lock for the whole access).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }
}

/// The shared halves of all slots, plus table-wide allocation state.
pub struct TableShared {
    /// Shared half of each slot, same indexing as the slot array.
    pub procs: [ProcShared; NPROC],
    /// Slot of the init process, once created.
    pub init_slot: Option<usize>,
    next_pid: u32,
}

impl TableShared {
    pub(crate) const fn new() -> Self {
        Self {
            procs: [const { ProcShared::new() }; NPROC],
            init_slot: None,
            next_pid: 1,
        }
    }

    /// Hands out the next pid. Monotonic up to wraparound.
    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid = self.next_pid.wrapping_add(1);
        pid
    }
}

/// The process table: one lock, `NPROC` slots.
pub struct ProcessTable {
    /// The global table lock; held across the context switch into a
    /// process and released by the dispatched side.
    pub lock: SpinLock<TableShared>,
    slots: [Process; NPROC],
}

impl ProcessTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            lock: SpinLock::named("ptable", TableShared::new()),
            slots: core::array::from_fn(Process::new),
        }
    }

    /// Returns slot `idx`.
    pub fn slot(&self, idx: usize) -> &Process {
        &self.slots[idx]
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU state.
pub struct Cpu {
    /// Slot running on this CPU, or `None` in the scheduler.
    pub current: Option<usize>,
    /// The scheduler context `sched` switches back into.
    pub scheduler_ctx: Context,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            current: None,
            scheduler_ctx: Context::zeroed(),
        }
    }
}

/// The fixed array of per-CPU structures.
pub struct CpuTable {
    cpus: [UnsafeCell<Cpu>; NCPU],
}

// SAFETY: each CPU only touches its own entry, and only with interrupts
// disabled, so no entry is ever accessed concurrently.
unsafe impl Sync for CpuTable {}

impl CpuTable {
    /// Creates the table.
    pub fn new() -> Self {
        Self {
            cpus: [const { UnsafeCell::new(Cpu::new()) }; NCPU],
        }
    }

    /// Returns the current CPU's entry.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled, so the caller cannot migrate while
    /// holding the reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self) -> &mut Cpu {
        unsafe { &mut *self.cpus[irq::cpu_id()].get() }
    }
}

impl Default for CpuTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the slot index of the process running on this CPU, if any.
/// Threads not bound to a CPU (debug consoles) have no current process.
pub fn current_slot(kernel: &Kernel) -> Option<usize> {
    irq::push_off();
    let current = if irq::cpu_id() == irq::UNBOUND_CPU {
        None
    } else {
        // SAFETY: interrupts are off.
        unsafe { kernel.cpus.current() }.current
    };
    irq::pop_off();
    current
}

/// Returns the pid of the process running on this CPU.
pub fn current_pid(kernel: &Kernel) -> Option<Pid> {
    let idx = current_slot(kernel)?;
    let table = kernel.ptable.lock.lock();
    Some(table.procs[idx].pid)
}

/// Whether the process running on this CPU has been killed.
pub fn current_killed(kernel: &Kernel) -> bool {
    let Some(idx) = current_slot(kernel) else {
        return false;
    };
    kernel.ptable.lock.lock().procs[idx].killed
}

/// Allocates a process slot: scans for UNUSED, installs EMBRYO with a
/// fresh pid and default priority, then builds the kernel stack and a
/// context that will run `entry` on first dispatch.
///
/// Any failure after EMBRYO rolls the slot back to UNUSED.
pub(crate) fn allocproc(
    kernel: &'static Kernel,
    entry: Box<dyn FnOnce() + Send>,
) -> Result<(usize, Pid), KernelError> {
    let (idx, pid) = {
        let mut table = kernel.ptable.lock.lock();
        let Some(idx) = table
            .procs
            .iter()
            .position(|shared| shared.state == ProcState::Unused)
        else {
            return Err(KernelError::OutOfProcSlots);
        };
        let pid = table.alloc_pid();
        let ctime = kernel.time.now();
        let shared = &mut table.procs[idx];
        shared.state = ProcState::Embryo;
        shared.pid = pid;
        shared.priority = 2;
        shared.ctime = ctime;
        shared.retime = 0;
        shared.rutime = 0;
        shared.stime = 0;
        shared.ticks_elapsed = 0;
        shared.killed = false;
        shared.chan = None;
        shared.satisfied = false;
        shared.kthread = false;
        shared.parent = None;
        (idx, pid)
    };

    // Stack and context allocation happen outside the lock; the slot is
    // EMBRYO, so nothing else will touch it.
    let Some(kstack) = kernel.machine.alloc_kstack() else {
        kernel.ptable.lock.lock().procs[idx].rollback();
        return Err(KernelError::OutOfMemory);
    };

    // SAFETY: EMBRYO slot under construction by this caller.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    data.context = kernel.machine.make_context(&kstack, entry);
    data.kstack = Some(kstack);
    data.tf = TrapFrame::default();
    data.name.clear();
    data.sz = 0;
    data.trapva = 0;

    Ok((idx, pid))
}

/// Sets up the first user process.
///
/// The slot gets an empty address space of one page, the given user
/// image, the root directory as cwd, and the name `init`. Orphans are
/// reparented here and it may never exit.
pub fn userinit(kernel: &'static Kernel, image: UserImage) -> Result<Pid, KernelError> {
    let (idx, pid) = allocproc(kernel, Box::new(move || sched::fork_return(kernel)))?;

    // SAFETY: EMBRYO slot under construction by this caller.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    data.vm = Some(kernel.machine.create_space());
    data.sz = PAGE_SIZE;
    data.tf = TrapFrame {
        pc: 0,
        sp: PAGE_SIZE,
        retval: 0,
        image: Some(image),
    };
    data.name.push_str("init");
    data.cwd = Some(kernel.fs.root());

    let mut table = kernel.ptable.lock.lock();
    assert!(table.init_slot.is_none(), "userinit: init already exists");
    table.init_slot = Some(idx);
    table.procs[idx].state = ProcState::Runnable;
    kinfo!("init: pid {pid} in slot {idx}");
    Ok(pid)
}

/// Creates a kernel thread whose context runs `body` directly and exits
/// on return. Used for the swap daemons.
///
/// The slot is marked `kthread`, parented to init, and given the root
/// directory as cwd.
pub fn create_kernel_thread(
    kernel: &'static Kernel,
    name: &'static str,
    body: fn(&'static Kernel),
) -> Result<Pid, KernelError> {
    let (idx, pid) = allocproc(
        kernel,
        Box::new(move || {
            // First dispatch arrives with the table lock held by the
            // scheduler; release it before entering the body.
            // SAFETY: that acquisition belongs to this context now.
            drop(unsafe { kernel.ptable.lock.adopt() });
            body(kernel);
            lifecycle::exit(kernel);
        }),
    )?;

    // SAFETY: EMBRYO slot under construction by this caller.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    data.name.push_str(name);
    data.cwd = Some(kernel.fs.root());

    let mut table = kernel.ptable.lock.lock();
    table.procs[idx].kthread = true;
    table.procs[idx].parent = table.init_slot;
    table.procs[idx].state = ProcState::Runnable;
    kinfo!("kernel thread {name}: pid {pid}");
    Ok(pid)
}

// ── Introspection ───────────────────────────────────────────────────────

/// Timing counters of the process with `pid`, if it exists.
pub fn stats_of(kernel: &Kernel, pid: Pid) -> Option<ProcStats> {
    let table = kernel.ptable.lock.lock();
    table
        .procs
        .iter()
        .find(|shared| shared.pid == pid && shared.state != ProcState::Unused)
        .map(ProcShared::stats)
}

/// Priority of the process with `pid`, if it exists.
pub fn priority_of(kernel: &Kernel, pid: Pid) -> Option<u8> {
    let table = kernel.ptable.lock.lock();
    table
        .procs
        .iter()
        .find(|shared| shared.pid == pid && shared.state != ProcState::Unused)
        .map(|shared| shared.priority)
}

/// Lifecycle state of the process with `pid`, if it exists.
pub fn state_of(kernel: &Kernel, pid: Pid) -> Option<ProcState> {
    let table = kernel.ptable.lock.lock();
    table
        .procs
        .iter()
        .find(|shared| shared.pid == pid && shared.state != ProcState::Unused)
        .map(|shared| shared.state)
}

/// Number of free process-table slots.
pub fn unused_slots(kernel: &Kernel) -> usize {
    let table = kernel.ptable.lock.lock();
    table
        .procs
        .iter()
        .filter(|shared| shared.state == ProcState::Unused)
        .count()
}

/// Prints a process listing to the console. Runs on Ctrl-P.
///
/// Takes no lock, so a wedged machine can still be inspected; the output
/// may be torn.
pub fn proc_dump(kernel: &Kernel) {
    // SAFETY: debug-only racy view, tolerated by contract.
    let table = unsafe { kernel.ptable.lock.force_get() };
    for (idx, shared) in table.procs.iter().enumerate() {
        if shared.state == ProcState::Unused {
            continue;
        }
        // SAFETY: same racy debug view as above.
        let data = unsafe { kernel.ptable.slot(idx).data_mut() };
        kprint!("{} {} {}", shared.pid, shared.state.name(), data.name);
        if shared.state == ProcState::Sleeping {
            let mut pcs = [0usize; DUMP_PCS];
            let n = kernel.machine.saved_pcs(&data.context, &mut pcs);
            for pc in &pcs[..n] {
                kprint!(" {pc:#x}");
            }
        }
        kprintln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_fixed_width() {
        for state in [
            ProcState::Unused,
            ProcState::Embryo,
            ProcState::Sleeping,
            ProcState::Runnable,
            ProcState::Running,
            ProcState::Zombie,
        ] {
            assert_eq!(state.name().len(), 6);
        }
    }

    #[test]
    fn pid_allocation_is_monotonic() {
        let mut table = TableShared::new();
        let a = table.alloc_pid();
        let b = table.alloc_pid();
        let c = table.alloc_pid();
        assert!(a < b && b < c);
        assert_eq!(a, Pid::new(1));
    }

    #[test]
    fn rollback_restores_unused_invariant() {
        let mut shared = ProcShared::new();
        shared.state = ProcState::Embryo;
        shared.pid = Pid::new(9);
        shared.priority = 2;
        shared.rollback();
        assert_eq!(shared.state, ProcState::Unused);
        assert!(shared.pid.is_none());
        assert_eq!(shared.priority, 0);
    }

    #[test]
    fn fd_alloc_fills_lowest_slot_first() {
        use crate::fs::ramfs::RamFs;
        use crate::fs::FileSystem;
        use alloc::string::ToString;

        let fs = RamFs::new();
        let mut data = ProcData::new();
        let file = || {
            Arc::new(File::new(
                "f".to_string(),
                fs.create("f").unwrap(),
                true,
                true,
            ))
        };
        assert_eq!(data.fd_alloc(file()).unwrap(), Fd::new(0));
        assert_eq!(data.fd_alloc(file()).unwrap(), Fd::new(1));
        data.ofile[0] = None;
        assert_eq!(data.fd_alloc(file()).unwrap(), Fd::new(0));
    }

    #[test]
    fn fd_alloc_reports_exhaustion() {
        use crate::fs::ramfs::RamFs;
        use crate::fs::FileSystem;
        use alloc::string::ToString;

        let fs = RamFs::new();
        let mut data = ProcData::new();
        for _ in 0..NOFILE {
            let file = Arc::new(File::new(
                "f".to_string(),
                fs.create("f").unwrap(),
                true,
                true,
            ));
            data.fd_alloc(file).unwrap();
        }
        let extra = Arc::new(File::new(
            "f".to_string(),
            fs.create("f").unwrap(),
            true,
            true,
        ));
        assert_eq!(data.fd_alloc(extra), Err(KernelError::OutOfDescriptors));
    }
}
