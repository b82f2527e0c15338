//! Lifecycle scenarios: fork/wait, reparenting, kill, rollback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec::Vec;

use muon_core::id::Pid;

use crate::hw::UserImage;
use crate::proc::{self, lifecycle, sleep, ProcState};
use crate::sim::{self, SimConfig};
use crate::syscall::{self, SYS_SLEEP};

const TIMEOUT: Duration = Duration::from_secs(30);

#[test]
fn fork_wait_returns_child_pid_and_frees_slot() {
    let done = Arc::new(AtomicBool::new(false));
    let log: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));
    let slots: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let log = log.clone();
        let slots = slots.clone();
        Arc::new(move |k, _| {
            let child: UserImage = Arc::new(|k, _| lifecycle::exit(k));

            slots.lock().unwrap().push(proc::unused_slots(k));
            let spawned1 = sim::fork_child(k, child.clone()).unwrap();
            let reaped1 = lifecycle::wait(k).unwrap();
            let spawned2 = sim::fork_child(k, child.clone()).unwrap();
            let reaped2 = lifecycle::wait(k).unwrap();
            slots.lock().unwrap().push(proc::unused_slots(k));

            log.lock().unwrap().extend([spawned1, reaped1, spawned2, reaped2]);
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("fork/wait scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    let log = log.lock().unwrap();
    assert_eq!(log[0], log[1], "wait must return the child's pid");
    assert_eq!(log[2], log[3]);
    assert_ne!(log[0], log[2], "pids are unique across time");
    assert!(log[2] > log[0], "pid allocation is monotonic");

    // The reaped child's slot went back to UNUSED with all fields zeroed.
    assert!(proc::stats_of(tk.kernel, log[2]).is_none());
    let slots = slots.lock().unwrap();
    assert_eq!(slots[0], slots[1], "reaping must free the slot");

    // Only init and the two daemons still own kernel stacks.
    assert_eq!(tk.machine.live_kstacks(), 3, "reaping frees kernel stacks");

    tk.shutdown();
}

#[test]
fn orphans_are_reparented_to_init() {
    let done = Arc::new(AtomicBool::new(false));
    let reaped: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));
    let spawned: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let reaped = reaped.clone();
        let spawned = spawned.clone();
        Arc::new(move |k, _| {
            // Grandchild spins a little, then exits.
            let grandchild: UserImage = Arc::new(|k, _| {
                sim::spin_ticks(k, 2);
                lifecycle::exit(k)
            });
            // The middle child forks the grandchild and exits at once,
            // orphaning it.
            let middle: UserImage = {
                let spawned = spawned.clone();
                Arc::new(move |k, _| {
                    let gc = sim::fork_child(k, grandchild.clone()).unwrap();
                    spawned.lock().unwrap().push(gc);
                    lifecycle::exit(k)
                })
            };

            let mid = sim::fork_child(k, middle).unwrap();
            spawned.lock().unwrap().push(mid);

            // Both the child and the reparented grandchild come back
            // through this wait loop.
            reaped.lock().unwrap().push(lifecycle::wait(k).unwrap());
            reaped.lock().unwrap().push(lifecycle::wait(k).unwrap());

            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("reparent scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    let mut reaped = reaped.lock().unwrap().clone();
    let mut spawned = spawned.lock().unwrap().clone();
    reaped.sort();
    spawned.sort();
    assert_eq!(reaped, spawned, "init reaps its child and the orphan");

    tk.shutdown();
}

#[test]
fn kill_wakes_a_sleeper_and_wait_reaps_it() {
    let child_pid = Arc::new(AtomicUsize::new(0));
    let reaped = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let init: UserImage = {
        let child_pid = child_pid.clone();
        let reaped = reaped.clone();
        let done = done.clone();
        Arc::new(move |k, _| {
            // The child sleeps far longer than the test runs; only kill
            // gets it out.
            let sleeper: UserImage = Arc::new(|k, _| {
                let rc = syscall::dispatch(k, SYS_SLEEP, [1_000_000, 0, 0, 0]);
                assert_eq!(rc, -1, "killed sleep returns -1");
                // Returning lets the trap path notice the kill flag.
            });
            let pid = sim::fork_child(k, sleeper).unwrap();
            child_pid.store(pid.as_u32() as usize, Ordering::SeqCst);

            let got = lifecycle::wait(k).unwrap();
            reaped.store(got.as_u32() as usize, Ordering::SeqCst);
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);

    // Wait for the child to commit to SLEEPING, then kill it from the
    // outside (the console path).
    tk.wait_until("child asleep", TIMEOUT, || {
        let pid = child_pid.load(Ordering::SeqCst);
        pid != 0
            && proc::state_of(tk.kernel, Pid::new(pid as u32)) == Some(ProcState::Sleeping)
    });
    let pid = Pid::new(child_pid.load(Ordering::SeqCst) as u32);
    sleep::kill(tk.kernel, pid).unwrap();

    tk.wait_until("kill scenario", TIMEOUT, || done.load(Ordering::SeqCst));
    assert_eq!(reaped.load(Ordering::SeqCst), pid.as_u32() as usize);

    tk.shutdown();
}

#[test]
fn kill_of_unknown_pid_fails() {
    let done = Arc::new(AtomicBool::new(false));
    let init: UserImage = {
        let done = done.clone();
        Arc::new(move |k, _| {
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };
    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("boot", TIMEOUT, || done.load(Ordering::SeqCst));

    assert!(sleep::kill(tk.kernel, Pid::new(4242)).is_err());
    tk.shutdown();
}

#[test]
fn fork_rolls_back_when_the_kernel_stack_fails() {
    let armed = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let outcome: Arc<Mutex<Vec<(bool, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let armed = armed.clone();
        let done = done.clone();
        let outcome = outcome.clone();
        Arc::new(move |k, _| {
            while !armed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let free_before = proc::unused_slots(k);
            let child: UserImage = Arc::new(|k, _| lifecycle::exit(k));
            let failed = sim::fork_child(k, child).is_err();
            let free_after = proc::unused_slots(k);
            outcome.lock().unwrap().push((failed, free_before, free_after));
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);
    tk.machine.fail_next_kstack();
    armed.store(true, Ordering::SeqCst);
    tk.wait_until("rollback scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    let outcome = outcome.lock().unwrap();
    let (failed, before, after) = outcome[0];
    assert!(failed, "fork must fail when the kernel stack cannot be allocated");
    assert_eq!(before, after, "the EMBRYO slot must roll back to UNUSED");

    tk.shutdown();
}

#[test]
fn proc_dump_lists_live_processes() {
    let done = Arc::new(AtomicBool::new(false));
    let init: UserImage = {
        let done = done.clone();
        Arc::new(move |k, _| {
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };
    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("boot", TIMEOUT, || done.load(Ordering::SeqCst));

    // Ctrl-P must not wedge even while everything sleeps; output goes to
    // the test's stdout.
    crate::console::handle_ctrl_key(tk.kernel, 0x10);
    tk.shutdown();
}
