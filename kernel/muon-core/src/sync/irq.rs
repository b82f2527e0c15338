//! Interrupt-masking operations behind a registered vtable.
//!
//! Holding a spin lock with interrupts enabled is a deadlock waiting to
//! happen: an interrupt handler on the same CPU could spin on the lock its
//! own CPU already holds. [`SpinLock`](super::SpinLock) therefore brackets
//! every hold with [`push_off`] / [`pop_off`]: disable interrupts on entry,
//! count nested acquires per CPU, and re-enable only when the outermost
//! hold ends — if interrupts were enabled to begin with.
//!
//! The masking itself is machine-specific, so the whole operation set is
//! registered as a static [`IrqOps`] table at kernel init (and by the test
//! machine on the host). Before registration every operation is a no-op on
//! a single fictitious CPU 0, which is what plain unit tests need.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Machine-provided interrupt and CPU-identity operations.
///
/// `push_off`/`pop_off` maintain a per-CPU nesting counter; `snapshot` and
/// `restore` carry the outermost-enable shadow across a context switch
/// (the shadow belongs to the kernel thread, not the CPU, while the thread
/// is suspended).
pub struct IrqOps {
    /// Disables interrupts on the current CPU and bumps its nesting count.
    pub push_off: fn(),
    /// Drops one nesting level; re-enables at level zero if the shadow
    /// says interrupts were on.
    pub pop_off: fn(),
    /// Current CPU's nesting depth.
    pub depth: fn() -> usize,
    /// Whether interrupts are currently enabled on this CPU.
    pub enabled: fn() -> bool,
    /// Unconditionally enables interrupts (scheduler idle path).
    pub enable: fn(),
    /// Reads the outermost-enable shadow.
    pub snapshot: fn() -> bool,
    /// Writes the outermost-enable shadow.
    pub restore: fn(bool),
    /// Current CPU id. Only stable while interrupts are off.
    pub cpu_id: fn() -> usize,
}

/// CPU id reported before a machine registers, and for threads a machine
/// never bound to a CPU (e.g. a debug console poking at a wedged kernel).
pub const UNBOUND_CPU: usize = usize::MAX;

fn noop() {}
fn no_depth() -> usize {
    0
}
fn not_enabled() -> bool {
    false
}
fn ignore_restore(_was: bool) {}
fn cpu_unbound() -> usize {
    UNBOUND_CPU
}

/// Operations used before a machine registers real ones.
static DEFAULT_OPS: IrqOps = IrqOps {
    push_off: noop,
    pop_off: noop,
    depth: no_depth,
    enabled: not_enabled,
    enable: noop,
    snapshot: not_enabled,
    restore: ignore_restore,
    cpu_id: cpu_unbound,
};

static OPS: AtomicPtr<IrqOps> = AtomicPtr::new(&DEFAULT_OPS as *const _ as *mut _);

/// Registers the machine's interrupt operations.
///
/// # Safety
///
/// The table must live for the rest of the program and its operations
/// must be safe to call from any context. May be called more than once;
/// later registrations win.
pub unsafe fn set_irq_ops(ops: &'static IrqOps) {
    OPS.store(ops as *const _ as *mut _, Ordering::Release);
}

#[inline]
fn ops() -> &'static IrqOps {
    // SAFETY: only `'static` tables are ever stored.
    unsafe { &*OPS.load(Ordering::Acquire) }
}

/// Disables interrupts on the current CPU and bumps its nesting counter.
#[inline]
pub fn push_off() {
    (ops().push_off)();
}

/// Drops one nesting level; re-enables interrupts at level zero if they
/// were enabled when the outermost [`push_off`] ran.
#[inline]
pub fn pop_off() {
    (ops().pop_off)();
}

/// Returns the current CPU's interrupt-nesting depth.
#[inline]
pub fn depth() -> usize {
    (ops().depth)()
}

/// Returns whether interrupts are enabled on the current CPU.
#[inline]
pub fn enabled() -> bool {
    (ops().enabled)()
}

/// Unconditionally enables interrupts on the current CPU.
#[inline]
pub fn enable() {
    (ops().enable)();
}

/// Reads the outermost-enable shadow for the current CPU.
#[inline]
pub fn snapshot() -> bool {
    (ops().snapshot)()
}

/// Writes the outermost-enable shadow for the current CPU.
#[inline]
pub fn restore(was_enabled: bool) {
    (ops().restore)(was_enabled);
}

/// Returns the current CPU's id.
#[inline]
pub fn cpu_id() -> usize {
    (ops().cpu_id)()
}
