//! Compile-time kernel configuration.
//!
//! Single source of truth for table sizes and scheduling constants. The
//! scheduling policy defaults from the `policy-*` cargo features; kernels
//! built for tests pass an explicit policy instead.

use crate::sched::policy::SchedPolicy;

/// Number of process-table slots.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Maximum number of CPUs.
pub const NCPU: usize = 4;

/// Ticks a process may stay on the CPU before the timer forces a yield
/// (except under FCFS, which never preempts).
pub const QUANTUM: u32 = 2;

/// Console commands remembered for the `history` syscall.
pub const HISTORY_DEPTH: usize = 16;

/// Saved program counters printed per sleeping process in the debug dump.
pub const DUMP_PCS: usize = 10;

/// The policy selected at build time.
pub const fn default_policy() -> SchedPolicy {
    #[cfg(feature = "policy-fcfs")]
    {
        SchedPolicy::Fcfs
    }
    #[cfg(all(feature = "policy-sml", not(feature = "policy-fcfs")))]
    {
        SchedPolicy::Sml
    }
    #[cfg(all(
        feature = "policy-dml",
        not(feature = "policy-fcfs"),
        not(feature = "policy-sml")
    ))]
    {
        SchedPolicy::Dml
    }
    #[cfg(not(any(feature = "policy-fcfs", feature = "policy-sml", feature = "policy-dml")))]
    {
        SchedPolicy::RoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_and_tables_are_sane() {
        assert!(QUANTUM >= 1);
        assert!(NCPU >= 1);
        assert!(NPROC > NCPU);
        assert!(HISTORY_DEPTH > 0 && DUMP_PCS > 0);
    }

    #[cfg(not(any(
        feature = "policy-fcfs",
        feature = "policy-sml",
        feature = "policy-dml"
    )))]
    #[test]
    fn round_robin_is_the_default_policy() {
        assert_eq!(default_policy(), SchedPolicy::RoundRobin);
    }
}
