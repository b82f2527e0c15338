//! Tick clock and per-process timing bookkeeper.
//!
//! One tick is one timer interrupt. The counter lives behind its own spin
//! lock because `sys_sleep` sleeps on it as a channel; a lock-free mirror
//! serves the many readers that only need an approximate "now" (creation
//! timestamps, stat dumps).

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::sync::SpinLock;

use crate::proc::ProcState;
use crate::Kernel;

/// The kernel clock.
pub struct TimeKeeper {
    /// Tick counter; sleepers on [`Channel::Ticks`](crate::proc::Channel)
    /// synchronize through this lock.
    pub ticks: SpinLock<u64>,
    /// Lock-free mirror of `ticks`, updated by the tick path.
    cache: AtomicU64,
}

impl TimeKeeper {
    /// A clock at tick zero.
    pub const fn new() -> Self {
        Self {
            ticks: SpinLock::named("time", 0),
            cache: AtomicU64::new(0),
        }
    }

    /// Advances the clock by one tick and returns the new value.
    pub fn advance(&self) -> u64 {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.cache.store(*ticks, Ordering::Release);
        *ticks
    }

    /// The current tick, without taking the lock. May lag `advance` by an
    /// instant; fine for timestamps and diagnostics.
    pub fn now(&self) -> u64 {
        self.cache.load(Ordering::Acquire)
    }
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tick statistics update: every process accrues one tick in the
/// counter matching its current state.
///
/// `retime + rutime + stime` therefore equals the ticks a process has
/// existed outside EMBRYO and ZOMBIE.
pub fn update_stats(kernel: &Kernel) {
    let mut table = kernel.ptable.lock.lock();
    for shared in table.procs.iter_mut() {
        match shared.state {
            ProcState::Sleeping => shared.stime += 1,
            ProcState::Runnable => shared.retime += 1,
            ProcState::Running => shared.rutime += 1,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_and_mirror() {
        let clock = TimeKeeper::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.now(), 2);
        assert_eq!(*clock.ticks.lock(), 2);
    }
}
