//! Next-process selectors.
//!
//! Exactly one policy is active per kernel. The selectors only pick; any
//! preemption or priority movement belongs to the timer path
//! ([`timer_tick`](super::timer_tick)) and to wakeup
//! ([`wakeup_locked`](crate::proc::sleep::wakeup_locked)). The static and
//! dynamic multilevel policies share one selector — they differ only in
//! those outside paths.

use crate::config::NPROC;
use crate::proc::{ProcState, TableShared};

/// The scheduling policy a kernel runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Slot-order round robin; the timer enforces the quantum.
    RoundRobin,
    /// First-come-first-served by creation tick; never preempted.
    Fcfs,
    /// Static multilevel: three priority tiers, round robin within each.
    Sml,
    /// Multilevel with aging: quantum expiry demotes, wake from sleep
    /// promotes to the top tier.
    Dml,
}

/// Per-scheduler round-robin positions, one per priority tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cursors {
    tiers: [usize; 3],
}

/// Picks the RUNNABLE slot with the smallest creation tick; ties go to
/// the lower slot index.
pub fn select_fcfs(table: &TableShared) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, shared) in table.procs.iter().enumerate() {
        if shared.state != ProcState::Runnable {
            continue;
        }
        match best {
            Some(b) if table.procs[b].ctime <= shared.ctime => {}
            _ => best = Some(idx),
        }
    }
    best
}

/// Picks a RUNNABLE slot from the highest non-empty priority tier,
/// round-robin within the tier.
///
/// Scans priority 3 down to 1; within a tier the scan starts at the
/// tier's cursor and wraps over all `NPROC` slots, and a hit advances
/// the cursor just past the chosen slot.
pub fn select_max_prio(table: &TableShared, cursors: &mut Cursors) -> Option<usize> {
    for priority in (1..=3u8).rev() {
        let cursor = &mut cursors.tiers[priority as usize - 1];
        for step in 0..NPROC {
            let idx = (*cursor + step) % NPROC;
            let shared = &table.procs[idx];
            if shared.state == ProcState::Runnable && shared.priority == priority {
                *cursor = (idx + 1) % NPROC;
                return Some(idx);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable(table: &mut TableShared, idx: usize, priority: u8, ctime: u64) {
        table.procs[idx].state = ProcState::Runnable;
        table.procs[idx].priority = priority;
        table.procs[idx].ctime = ctime;
    }

    #[test]
    fn fcfs_picks_earliest_creation() {
        let mut table = TableShared::new();
        runnable(&mut table, 3, 2, 30);
        runnable(&mut table, 5, 2, 10);
        runnable(&mut table, 9, 2, 20);
        assert_eq!(select_fcfs(&table), Some(5));
    }

    #[test]
    fn fcfs_ties_break_by_slot_index() {
        let mut table = TableShared::new();
        runnable(&mut table, 7, 2, 10);
        runnable(&mut table, 2, 2, 10);
        assert_eq!(select_fcfs(&table), Some(2));
    }

    #[test]
    fn fcfs_empty_table() {
        let table = TableShared::new();
        assert_eq!(select_fcfs(&table), None);
    }

    #[test]
    fn max_prio_prefers_higher_tier() {
        let mut table = TableShared::new();
        let mut cursors = Cursors::default();
        runnable(&mut table, 1, 1, 0);
        runnable(&mut table, 2, 3, 0);
        runnable(&mut table, 3, 2, 0);
        assert_eq!(select_max_prio(&table, &mut cursors), Some(2));
    }

    #[test]
    fn max_prio_round_robins_within_tier() {
        let mut table = TableShared::new();
        let mut cursors = Cursors::default();
        runnable(&mut table, 4, 3, 0);
        runnable(&mut table, 8, 3, 0);

        // Alternates between the two tier-3 slots as each pick advances
        // the cursor past the winner.
        assert_eq!(select_max_prio(&table, &mut cursors), Some(4));
        assert_eq!(select_max_prio(&table, &mut cursors), Some(8));
        assert_eq!(select_max_prio(&table, &mut cursors), Some(4));
    }

    #[test]
    fn max_prio_falls_through_empty_tiers() {
        let mut table = TableShared::new();
        let mut cursors = Cursors::default();
        runnable(&mut table, 6, 1, 0);
        assert_eq!(select_max_prio(&table, &mut cursors), Some(6));
    }

    #[test]
    fn max_prio_ignores_non_runnable() {
        let mut table = TableShared::new();
        let mut cursors = Cursors::default();
        runnable(&mut table, 6, 3, 0);
        table.procs[6].state = ProcState::Sleeping;
        assert_eq!(select_max_prio(&table, &mut cursors), None);
    }

    #[test]
    fn cursor_does_not_starve_later_slots() {
        let mut table = TableShared::new();
        let mut cursors = Cursors::default();
        runnable(&mut table, 0, 3, 0);
        runnable(&mut table, 1, 3, 0);
        runnable(&mut table, 2, 3, 0);

        let picks: alloc::vec::Vec<_> = (0..6)
            .map(|_| select_max_prio(&table, &mut cursors).unwrap())
            .collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2]);
    }
}
