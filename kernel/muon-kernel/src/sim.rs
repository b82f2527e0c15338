//! Simulated machine for host tests.
//!
//! The whole kernel runs on the host: each kernel context (per-CPU
//! scheduler, process, daemon) is an OS thread parked on its own
//! condvar slot, and `context_switch` is exactly the two-stack dance the
//! kernel expects — wake the target's slot, park on your own. CPU
//! identity and the per-CPU interrupt state travel with the switch, so
//! the `push_off`/`pop_off` discipline behaves as it would on hardware.
//!
//! Frames come from a bounded in-memory pool (which is what makes the
//! swap machinery fire), address spaces are plain page-number maps, and
//! the filesystem is the in-tree ramfs.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use muon_core::id::Pid;
use muon_core::page::{Frame, Pte, Vpn, PAGE_SIZE};
use muon_core::sync::irq::{self, IrqOps};

use crate::error::KernelError;
use crate::fs::ramfs::RamFs;
use crate::hw::{Context, FrameAlloc, KernelStack, Machine, UserImage, VmSpace};
use crate::proc::{self, current_slot, lifecycle, sleep, Channel};
use crate::sched::policy::SchedPolicy;
use crate::Kernel;

// ── Per-thread CPU identity and interrupt state ─────────────────────────

/// What a CPU carries: its id, the spin-lock nesting depth, the
/// outermost-enable shadow, and the live interrupt flag. The bundle
/// travels across `context_switch`, because after a switch the *new*
/// context is what runs on that CPU.
#[derive(Debug, Clone, Copy)]
struct CpuBundle {
    cpu: usize,
    noff: usize,
    intena: bool,
    irq_on: bool,
}

impl CpuBundle {
    const fn unbound() -> Self {
        Self {
            cpu: usize::MAX,
            noff: 0,
            intena: false,
            irq_on: false,
        }
    }
}

thread_local! {
    static CPU: RefCell<CpuBundle> = const { RefCell::new(CpuBundle::unbound()) };
    static SLOT: RefCell<usize> = const { RefCell::new(usize::MAX) };
}

fn tls_slot() -> usize {
    SLOT.with_borrow(|slot| *slot)
}

fn set_tls_slot(slot: usize) {
    SLOT.with_borrow_mut(|s| *s = slot);
}

fn hook_push_off() {
    CPU.with_borrow_mut(|c| {
        if c.noff == 0 {
            c.intena = c.irq_on;
            c.irq_on = false;
        }
        c.noff += 1;
    });
}

fn hook_pop_off() {
    CPU.with_borrow_mut(|c| {
        assert!(!c.irq_on, "pop_off with interrupts enabled");
        assert!(c.noff >= 1, "unbalanced pop_off");
        c.noff -= 1;
        if c.noff == 0 && c.intena {
            c.irq_on = true;
        }
    });
}

fn hook_depth() -> usize {
    CPU.with_borrow(|c| c.noff)
}

fn hook_enabled() -> bool {
    CPU.with_borrow(|c| c.irq_on)
}

fn hook_enable() {
    CPU.with_borrow_mut(|c| c.irq_on = true);
}

fn hook_snapshot() -> bool {
    CPU.with_borrow(|c| c.intena)
}

fn hook_restore(was_enabled: bool) {
    CPU.with_borrow_mut(|c| c.intena = was_enabled);
}

fn hook_cpu_id() -> usize {
    CPU.with_borrow(|c| c.cpu)
}

static SIM_IRQ_OPS: IrqOps = IrqOps {
    push_off: hook_push_off,
    pop_off: hook_pop_off,
    depth: hook_depth,
    enabled: hook_enabled,
    enable: hook_enable,
    snapshot: hook_snapshot,
    restore: hook_restore,
    cpu_id: hook_cpu_id,
};

fn print_stdout(args: core::fmt::Arguments<'_>) {
    print!("{args}");
}

/// Installs the simulated interrupt hooks and a stdout log sink, once
/// per test binary.
fn install_hooks() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // SAFETY: the hook table is 'static and every hook is a pure
        // TLS accessor.
        unsafe {
            irq::set_irq_ops(&SIM_IRQ_OPS);
            crate::log::set_print_fn(print_stdout);
        }
    });
}

// ── The simulated machine ───────────────────────────────────────────────

/// One context-registry slot: a parked thread and its dispatch signal.
struct CtxSlot {
    state: Mutex<CtxState>,
    cv: Condvar,
}

struct CtxState {
    run: bool,
    retired: bool,
    bundle: CpuBundle,
}

impl CtxSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(CtxState {
                run: false,
                retired: false,
                bundle: CpuBundle::unbound(),
            }),
            cv: Condvar::new(),
        }
    }
}

/// The thread-backed [`Machine`].
pub(crate) struct SimMachine {
    cpu_count: usize,
    registry: Mutex<Vec<Arc<CtxSlot>>>,
    shutdown: AtomicBool,
    auto_tick: AtomicBool,
    kernel: OnceLock<&'static Kernel>,
    live_kstacks: AtomicUsize,
    next_kstack: AtomicUsize,
    fail_next_kstack: AtomicBool,
    flushes: AtomicUsize,
}

impl SimMachine {
    pub(crate) fn new(cpu_count: usize, auto_tick: bool) -> Self {
        Self {
            cpu_count,
            registry: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            auto_tick: AtomicBool::new(auto_tick),
            kernel: OnceLock::new(),
            live_kstacks: AtomicUsize::new(0),
            next_kstack: AtomicUsize::new(0),
            fail_next_kstack: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
        }
    }

    fn register_slot(&self) -> (usize, Arc<CtxSlot>) {
        let mut registry = self.registry.lock().unwrap();
        let idx = registry.len();
        let slot = Arc::new(CtxSlot::new());
        registry.push(slot.clone());
        (idx, slot)
    }

    fn slot(&self, idx: usize) -> Arc<CtxSlot> {
        self.registry.lock().unwrap()[idx].clone()
    }

    /// Binds the calling thread as CPU `cpu` and gives it a context slot
    /// so processes can switch back into it.
    pub(crate) fn bind_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpu_count);
        let (idx, _) = self.register_slot();
        set_tls_slot(idx);
        CPU.with_borrow_mut(|c| {
            *c = CpuBundle {
                cpu,
                noff: 0,
                intena: false,
                irq_on: false,
            }
        });
    }

    /// Asks the scheduler loops to return at their next idle moment.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Makes the next `alloc_kstack` fail, for rollback tests.
    pub(crate) fn fail_next_kstack(&self) {
        self.fail_next_kstack.store(true, Ordering::SeqCst);
    }

    /// Number of kernel stacks currently allocated.
    pub(crate) fn live_kstacks(&self) -> usize {
        self.live_kstacks.load(Ordering::SeqCst)
    }

    /// Number of address-space flushes performed.
    pub(crate) fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Machine for SimMachine {
    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn alloc_kstack(&self) -> Option<KernelStack> {
        if self.fail_next_kstack.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.live_kstacks.fetch_add(1, Ordering::SeqCst);
        Some(KernelStack(self.next_kstack.fetch_add(1, Ordering::SeqCst)))
    }

    fn free_kstack(&self, _stack: KernelStack) {
        self.live_kstacks.fetch_sub(1, Ordering::SeqCst);
    }

    fn make_context(&self, _stack: &KernelStack, entry: Box<dyn FnOnce() + Send>) -> Context {
        let (idx, slot) = self.register_slot();
        thread::Builder::new()
            .name(format!("ctx-{idx}"))
            .spawn(move || {
                // Park until first dispatched, or torn down unstarted.
                let bundle = {
                    let mut st = slot.state.lock().unwrap();
                    while !st.run && !st.retired {
                        st = slot.cv.wait(st).unwrap();
                    }
                    if st.retired {
                        return;
                    }
                    st.run = false;
                    st.bundle
                };
                set_tls_slot(idx);
                CPU.with_borrow_mut(|c| *c = bundle);
                entry();
                unreachable!("context entry returned");
            })
            .expect("spawn context thread");
        Context {
            pc: 0,
            sp: idx,
            regs: [0; 12],
        }
    }

    fn retire_context(&self, ctx: &Context) {
        // Only never-started contexts can be torn down; an exited
        // process's thread stays parked in its final switch (releasing
        // it would unwind frozen kernel frames).
        let slot = self.slot(ctx.sp);
        let mut st = slot.state.lock().unwrap();
        st.retired = true;
        slot.cv.notify_all();
    }

    unsafe fn context_switch(&self, save: *mut Context, load: *const Context) {
        let my_slot = tls_slot();
        assert_ne!(my_slot, usize::MAX, "context switch off-CPU");
        // Saving the current execution: record which slot holds it.
        unsafe { (*save).sp = my_slot };
        let load_slot = unsafe { (*load).sp };

        let bundle = CPU.with_borrow(|c| *c);
        let target = self.slot(load_slot);
        let me = self.slot(my_slot);

        {
            let mut st = target.state.lock().unwrap();
            st.bundle = bundle;
            st.run = true;
            target.cv.notify_all();
        }

        let resumed = {
            let mut st = me.state.lock().unwrap();
            while !st.run {
                st = me.cv.wait(st).unwrap();
            }
            st.run = false;
            st.bundle
        };
        CPU.with_borrow_mut(|c| *c = resumed);
    }

    fn create_space(&self) -> Box<dyn VmSpace> {
        Box::new(SimVm::default())
    }

    fn switch_address_space(&self, _space: Option<&dyn VmSpace>) {
        // Translation goes through the map directly; nothing cached.
    }

    fn flush_address_space(&self, _space: &dyn VmSpace) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn saved_pcs(&self, ctx: &Context, out: &mut [usize]) -> usize {
        // Two synthetic frames: the context's slot and a sentinel.
        let n = out.len().min(2);
        if n > 0 {
            out[0] = 0x8000_0000 + ctx.sp;
        }
        if n > 1 {
            out[1] = 0x8000_ffff;
        }
        n
    }

    fn wait_for_interrupt(&self) {
        if self.auto_tick.load(Ordering::SeqCst) && hook_cpu_id() == 0 {
            if let Some(kernel) = self.kernel.get() {
                crate::sched::timer_tick(kernel);
            }
        }
        thread::sleep(Duration::from_micros(100));
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ── Address space and frame pool ────────────────────────────────────────

/// Page-number map standing in for a hardware page table.
#[derive(Default)]
struct SimVm {
    entries: BTreeMap<usize, Pte>,
}

impl VmSpace for SimVm {
    fn pte(&self, vpn: Vpn) -> Option<Pte> {
        self.entries.get(&vpn.as_usize()).copied()
    }

    fn set_pte(&mut self, vpn: Vpn, pte: Pte) {
        self.entries.insert(vpn.as_usize(), pte);
    }

    fn unmap(&mut self, vpn: Vpn) -> Option<Pte> {
        self.entries.remove(&vpn.as_usize())
    }
}

/// Bounded in-memory frame pool.
pub(crate) struct SimFrames {
    pool: Mutex<Vec<usize>>,
    storage: Vec<Box<std::cell::UnsafeCell<[u8; PAGE_SIZE]>>>,
}

// SAFETY: frame contents are only touched by whoever owns the frame, per
// the `frame_bytes` contract.
unsafe impl Sync for SimFrames {}

impl SimFrames {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            pool: Mutex::new((0..count).collect()),
            storage: (0..count)
                .map(|_| Box::new(std::cell::UnsafeCell::new([0u8; PAGE_SIZE])))
                .collect(),
        }
    }
}

impl FrameAlloc for SimFrames {
    fn alloc_frame(&self) -> Option<Frame> {
        self.pool.lock().unwrap().pop().map(Frame::new)
    }

    fn free_frame(&self, frame: Frame) {
        let mut pool = self.pool.lock().unwrap();
        debug_assert!(!pool.contains(&frame.as_usize()), "double free of frame");
        pool.push(frame.as_usize());
    }

    fn free_frames(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    unsafe fn frame_bytes(&self, frame: Frame) -> *mut u8 {
        self.storage[frame.as_usize()].get().cast()
    }
}

// ── Test harness ────────────────────────────────────────────────────────

/// Knobs for a simulated kernel.
pub(crate) struct SimConfig {
    pub cpus: usize,
    pub frames: usize,
    pub policy: SchedPolicy,
    pub auto_tick: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            frames: 64,
            policy: SchedPolicy::RoundRobin,
            auto_tick: false,
        }
    }
}

/// A booted kernel plus its CPU threads.
pub(crate) struct TestKernel {
    pub kernel: &'static Kernel,
    pub machine: &'static SimMachine,
    pub frames: &'static SimFrames,
    cpu_threads: Vec<thread::JoinHandle<()>>,
}

/// Builds a kernel over the simulated machine, installs `init` as the
/// first process, and brings up the CPU threads.
pub(crate) fn boot(config: SimConfig, init: UserImage) -> TestKernel {
    install_hooks();

    let machine: &'static SimMachine =
        Box::leak(Box::new(SimMachine::new(config.cpus, config.auto_tick)));
    let frames: &'static SimFrames = Box::leak(Box::new(SimFrames::new(config.frames)));
    let fs: &'static RamFs = Box::leak(Box::new(RamFs::new()));
    let kernel: &'static Kernel =
        Box::leak(Box::new(Kernel::new(machine, frames, fs, config.policy)));
    machine
        .kernel
        .set(kernel)
        .unwrap_or_else(|_| unreachable!("kernel installed twice"));

    proc::userinit(kernel, init).expect("userinit");

    let cpu_threads = (0..config.cpus)
        .map(|cpu| {
            thread::Builder::new()
                .name(format!("cpu-{cpu}"))
                .spawn(move || {
                    machine.bind_cpu(cpu);
                    kernel.run_cpu();
                })
                .expect("spawn cpu thread")
        })
        .collect();

    TestKernel {
        kernel,
        machine,
        frames,
        cpu_threads,
    }
}

impl TestKernel {
    /// Spins until `pred` holds, panicking after `timeout` with `what`.
    pub(crate) fn wait_until(&self, what: &str, timeout: Duration, pred: impl Fn() -> bool) {
        let start = Instant::now();
        while !pred() {
            assert!(start.elapsed() <= timeout, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the scheduler loops and joins the CPU threads. Every
    /// process must be parked (sleeping or zombie) by now.
    pub(crate) fn shutdown(self) {
        self.machine.request_shutdown();
        for handle in self.cpu_threads {
            handle.join().expect("cpu thread panicked");
        }
    }
}

// ── Program-side helpers ────────────────────────────────────────────────

/// Forks with an explicit child image: swaps the caller's trap-frame
/// image for `child` around the fork, so the parent's own payload is
/// untouched while the child inherits `child`.
pub(crate) fn fork_child(kernel: &'static Kernel, child: UserImage) -> Result<Pid, KernelError> {
    let idx = current_slot(kernel).expect("fork_child outside a process");
    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    let saved = data.tf.image.take();
    data.tf.image = Some(child);
    let result = lifecycle::fork(kernel);
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    data.tf.image = saved;
    result
}

/// Parks the calling process forever on its own slot channel. Init ends
/// its scenario here so the CPU can go idle; child-exit wakeups just put
/// it back to sleep.
pub(crate) fn park_forever(kernel: &'static Kernel) -> ! {
    let me = current_slot(kernel).expect("park outside a process");
    loop {
        let table = kernel.ptable.lock.lock();
        drop(sleep::sleep_on(kernel, Channel::Proc(me), table));
    }
}

/// Burns `n` ticks of CPU time by delivering timer interrupts to the
/// caller.
pub(crate) fn spin_ticks(kernel: &'static Kernel, n: u64) {
    for _ in 0..n {
        crate::sched::timer_tick(kernel);
    }
}
