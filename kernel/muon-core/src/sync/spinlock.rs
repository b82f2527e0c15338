//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention, and
//! enforces the kernel's critical-section discipline: interrupts are
//! masked on the holding CPU for the whole hold (via the [`irq`] hooks)
//! and the owning CPU is recorded for diagnostics and [`holding`] checks.
//!
//! [`holding`]: SpinLock::holding

use core::ops::{Deref, DerefMut};

use super::irq;
use super::loom_compat::{AtomicBool, AtomicUsize, Ordering, UnsafeCell};

/// Owner value while the lock is free.
const NO_OWNER: usize = usize::MAX;

/// A spin lock guarding `T`.
///
/// Const-constructable so it can live in statics and in const-initialized
/// tables. The guard releases the lock when dropped; the scheduler's
/// hold-across-context-switch protocol additionally uses
/// [`force_unlock`](Self::force_unlock) from a stack that never saw the
/// acquire.
pub struct SpinLock<T> {
    locked: AtomicBool,
    /// CPU currently holding the lock, or [`NO_OWNER`].
    owner: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: the lock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different
// CPUs across acquisitions.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Creates a new unlocked `SpinLock` with a diagnostic name.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Interrupts are disabled on this CPU before the first acquire
    /// attempt and stay disabled until the guard (and any nested guards)
    /// drop. Returns a [`SpinLockGuard`] that releases the lock on drop.
    ///
    /// # Panics
    ///
    /// Panics if this CPU already holds the lock — a re-acquire would
    /// spin forever with interrupts off.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        irq::push_off();

        if self.holding() {
            panic!("spinlock {}: recursive acquire", self.name);
        }

        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(irq::cpu_id(), Ordering::Relaxed);
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it was
    /// already held. Useful in panic paths where blocking would wedge the
    /// machine further.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        irq::push_off();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(irq::cpu_id(), Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            irq::pop_off();
            None
        }
    }

    /// Returns `true` if the current CPU holds this lock.
    ///
    /// Only meaningful while interrupts are disabled; otherwise the
    /// answer can be stale by the time the caller looks at it. A thread
    /// not bound to any CPU is never considered the holder.
    pub fn holding(&self) -> bool {
        let me = irq::cpu_id();
        me != irq::UNBOUND_CPU
            && self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == me
    }

    /// Returns the diagnostic name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Releases the lock without a guard.
    ///
    /// The scheduler dispatches a new context while holding the process
    /// table lock; the first thing the new context does is release that
    /// lock, from a stack that has no guard for it. This is the release
    /// half of that protocol.
    ///
    /// # Safety
    ///
    /// The caller must be on the CPU that holds the lock, and no guard
    /// for this acquisition may exist (or it would release a second
    /// time).
    pub unsafe fn force_unlock(&self) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        irq::pop_off();
    }

    /// Claims an acquisition made by another context and returns a guard
    /// for it.
    ///
    /// The counterpart of [`force_unlock`](Self::force_unlock): a freshly
    /// dispatched context that inherits a held lock from the scheduler
    /// adopts the acquisition so it can release it (or pass it on) through
    /// the normal guard protocol.
    ///
    /// # Safety
    ///
    /// The lock must currently be held on behalf of the calling CPU, and
    /// no other guard for this acquisition may exist.
    pub unsafe fn adopt(&self) -> SpinLockGuard<'_, T> {
        debug_assert!(self.holding(), "adopt of a lock this cpu does not hold");
        SpinLockGuard { lock: self }
    }

    /// Returns a mutable reference to the data without locking.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the
    /// data. Intended for debug dumps on a wedged machine.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Returns a reference to the underlying [`SpinLock`].
    ///
    /// Used by `sleep` to re-acquire the caller's condition lock after
    /// releasing it for the blocking window.
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        irq::pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal interrupt ops for the host: a per-thread nesting counter
    /// and a unique per-thread CPU id, so owner tracking and the
    /// recursive-acquire check behave as they would on a machine.
    mod test_irq {
        use std::cell::Cell;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Once;

        use crate::sync::irq::{set_irq_ops, IrqOps};

        static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

        thread_local! {
            static CPU: Cell<usize> = Cell::new(NEXT_CPU.fetch_add(1, Ordering::Relaxed));
            static NOFF: Cell<usize> = const { Cell::new(0) };
            static INTENA: Cell<bool> = const { Cell::new(false) };
        }

        fn push_off() {
            NOFF.with(|n| n.set(n.get() + 1));
        }
        fn pop_off() {
            NOFF.with(|n| n.set(n.get().saturating_sub(1)));
        }
        fn depth() -> usize {
            NOFF.with(Cell::get)
        }
        fn enabled() -> bool {
            false
        }
        fn enable() {}
        fn snapshot() -> bool {
            INTENA.with(Cell::get)
        }
        fn restore(was: bool) {
            INTENA.with(|i| i.set(was));
        }
        fn cpu_id() -> usize {
            CPU.with(Cell::get)
        }

        static OPS: IrqOps = IrqOps {
            push_off,
            pop_off,
            depth,
            enabled,
            enable,
            snapshot,
            restore,
            cpu_id,
        };

        pub fn install() {
            static ONCE: Once = Once::new();
            ONCE.call_once(|| {
                // SAFETY: the table is 'static and every op is a pure
                // TLS accessor.
                unsafe { set_irq_ops(&OPS) };
            });
        }
    }

    #[test]
    fn lock_unlock() {
        test_irq::install();
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        // Lock is released after the guard is dropped.
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        test_irq::install();
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        test_irq::install();
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn named_constructor() {
        test_irq::install();
        let lock = SpinLock::named("ptable", ());
        assert_eq!(lock.name(), "ptable");
        let _guard = lock.lock();
    }

    #[test]
    fn holding_tracks_owner() {
        test_irq::install();
        let lock = SpinLock::new(());
        assert!(!lock.holding());
        let guard = lock.lock();
        assert!(lock.holding());
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    fn force_unlock_releases() {
        test_irq::install();
        let lock = SpinLock::new(5);
        let guard = lock.lock();
        core::mem::forget(guard);
        // SAFETY: the guard was forgotten, so this is the only release.
        unsafe { lock.force_unlock() };
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn contended_increments_are_not_lost() {
        test_irq::install();
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * ITERS);
    }
}
