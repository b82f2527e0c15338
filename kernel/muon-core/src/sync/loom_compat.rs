//! Concurrency-primitive aliases for the spin lock.
//!
//! The lock names these aliases instead of `core::sync::atomic` and
//! `core::cell` directly. Ordinary builds resolve them to the real
//! types; a `--cfg loom` build resolves them to loom's instrumented
//! doubles, which lets the acquire/release protocol run under loom's
//! model checker without touching the lock's source. Only what the
//! lock actually uses is aliased: the two atomics and the cell.

#[cfg(not(loom))]
pub(crate) use core::cell::UnsafeCell;
#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::cell::UnsafeCell;
#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
