//! Synchronization primitives.
//!
//! The kernel's mutual-exclusion discipline: short critical sections under
//! [`SpinLock`], with interrupts masked on the holding CPU for the whole
//! hold (nested acquires tracked by a per-CPU counter behind the
//! [`irq`] hooks).

pub mod irq;
mod loom_compat;
mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
