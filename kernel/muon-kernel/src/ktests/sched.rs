//! Scheduling scenarios: policy behavior, time accounting, and the
//! lost-wakeup stress.

use std::string::String;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec::Vec;

use muon_core::id::Pid;
use muon_core::sync::SpinLock;

use crate::hw::UserImage;
use crate::proc::{self, lifecycle, sleep, Channel};
use crate::sched::policy::SchedPolicy;
use crate::sim::{self, SimConfig};
use crate::syscall::{self, SYS_SLEEP};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Scenario 3: under FCFS, three CPU-bound children created in order
/// finish strictly in creation order, with no interleaving.
#[test]
fn fcfs_runs_children_in_creation_order() {
    let done = Arc::new(AtomicBool::new(false));
    let spawned: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));
    let finished: Arc<Mutex<Vec<Pid>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let spawned = spawned.clone();
        let finished = finished.clone();
        Arc::new(move |k, _| {
            let hog: UserImage = {
                let finished = finished.clone();
                Arc::new(move |k, _| {
                    sim::spin_ticks(k, 4);
                    finished
                        .lock()
                        .unwrap()
                        .push(proc::current_pid(k).unwrap());
                    lifecycle::exit(k)
                })
            };

            // Stagger creation ticks so ctimes are strictly ordered.
            for _ in 0..3 {
                let pid = sim::fork_child(k, hog.clone()).unwrap();
                spawned.lock().unwrap().push(pid);
                sim::spin_ticks(k, 1);
            }
            for _ in 0..3 {
                lifecycle::wait(k).unwrap();
            }
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        policy: SchedPolicy::Fcfs,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("fcfs scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    assert_eq!(
        *finished.lock().unwrap(),
        *spawned.lock().unwrap(),
        "completion order must equal creation order"
    );
    tk.shutdown();
}

/// Scenario 4: under SML a priority-3 process runs to completion before
/// a priority-1 process gets its first tick.
#[test]
fn sml_high_priority_finishes_before_low_starts() {
    let done = Arc::new(AtomicBool::new(false));
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let events = events.clone();
        Arc::new(move |k, _| {
            let high: UserImage = {
                let events = events.clone();
                Arc::new(move |k, _| {
                    events.lock().unwrap().push("high-start".into());
                    sim::spin_ticks(k, 6);
                    events.lock().unwrap().push("high-end".into());
                    lifecycle::exit(k)
                })
            };
            let low: UserImage = {
                let events = events.clone();
                Arc::new(move |k, _| {
                    events.lock().unwrap().push("low-start".into());
                    sim::spin_ticks(k, 2);
                    events.lock().unwrap().push("low-end".into());
                    lifecycle::exit(k)
                })
            };

            // Children inherit the caller's priority at fork.
            lifecycle::set_prio(k, 3).unwrap();
            sim::fork_child(k, high).unwrap();
            lifecycle::set_prio(k, 1).unwrap();
            sim::fork_child(k, low).unwrap();
            lifecycle::set_prio(k, 2).unwrap();

            lifecycle::wait(k).unwrap();
            lifecycle::wait(k).unwrap();
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        policy: SchedPolicy::Sml,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("sml scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    let events = events.lock().unwrap();
    let high_end = events.iter().position(|e| e == "high-end").unwrap();
    let low_start = events.iter().position(|e| e == "low-start").unwrap();
    assert!(
        high_end < low_start,
        "priority 3 must drain before priority 1 runs: {events:?}"
    );
    tk.shutdown();
}

/// Scenario 5: under DML a CPU hog starting at priority 3 is at 1 after
/// two full quanta, and a process waking from sleep is back at 3.
#[test]
fn dml_ages_hogs_down_and_promotes_wakers() {
    let done = Arc::new(AtomicBool::new(false));
    let hog_prio = Arc::new(AtomicU8::new(0));
    let sleeper_prio = Arc::new(AtomicU8::new(0));

    let init: UserImage = {
        let done = done.clone();
        let hog_prio = hog_prio.clone();
        let sleeper_prio = sleeper_prio.clone();
        Arc::new(move |k, _| {
            let hog: UserImage = {
                let hog_prio = hog_prio.clone();
                Arc::new(move |k, _| {
                    lifecycle::set_prio(k, 3).unwrap();
                    // Two full quanta: 3 → 2 → 1.
                    sim::spin_ticks(k, 2 * crate::config::QUANTUM as u64);
                    let me = proc::current_pid(k).unwrap();
                    hog_prio.store(proc::priority_of(k, me).unwrap(), Ordering::SeqCst);
                    lifecycle::exit(k)
                })
            };
            let sleeper: UserImage = {
                let sleeper_prio = sleeper_prio.clone();
                Arc::new(move |k, _| {
                    lifecycle::set_prio(k, 1).unwrap();
                    assert_eq!(syscall::dispatch(k, SYS_SLEEP, [3, 0, 0, 0]), 0);
                    let me = proc::current_pid(k).unwrap();
                    sleeper_prio.store(proc::priority_of(k, me).unwrap(), Ordering::SeqCst);
                    lifecycle::exit(k)
                })
            };

            sim::fork_child(k, hog).unwrap();
            sim::fork_child(k, sleeper).unwrap();
            lifecycle::wait(k).unwrap();
            lifecycle::wait(k).unwrap();
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        policy: SchedPolicy::Dml,
        auto_tick: true,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("dml scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    assert_eq!(
        hog_prio.load(Ordering::SeqCst),
        1,
        "two quantum expiries demote 3 to 1"
    );
    assert_eq!(
        sleeper_prio.load(Ordering::SeqCst),
        3,
        "waking from sleep promotes to 3"
    );
    tk.shutdown();
}

/// Scenario 2: wait2 returns timing counters matching what the child
/// actually did.
#[test]
fn wait2_reports_time_accounting() {
    const BUSY: u64 = 6;
    const SLEEP: u64 = 4;

    let done = Arc::new(AtomicBool::new(false));
    let fork_tick = Arc::new(AtomicU64::new(u64::MAX));
    let report: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let fork_tick = fork_tick.clone();
        let report = report.clone();
        Arc::new(move |k, _| {
            let child: UserImage = Arc::new(move |k, _| {
                sim::spin_ticks(k, BUSY);
                assert_eq!(syscall::dispatch(k, SYS_SLEEP, [SLEEP as usize, 0, 0, 0]), 0);
                lifecycle::exit(k)
            });

            fork_tick.store(k.time.now(), Ordering::SeqCst);
            sim::fork_child(k, child).unwrap();

            // Collect stats through the real syscall surface: user
            // buffers live in init's own memory.
            let base = syscall::dispatch(k, syscall::SYS_SBRK, [4096, 0, 0, 0]);
            assert!(base > 0);
            let base = base as usize;
            let args = [base, base + 8, base + 16, base + 24];
            let pid = syscall::dispatch(k, syscall::SYS_WAIT2, args);
            assert!(pid > 0, "wait2 returns the child pid");

            let idx = proc::current_slot(k).unwrap();
            // SAFETY: init's own data.
            let data = unsafe { k.ptable.slot(idx).data_mut() };
            let mut values = Vec::new();
            for va in args {
                let mut buf = [0u8; 8];
                crate::vm::copy_in(k, data, va, &mut buf).unwrap();
                values.push(i64::from_le_bytes(buf));
            }
            report.lock().unwrap().extend(values);
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        auto_tick: true,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("wait2 scenario", TIMEOUT, || done.load(Ordering::SeqCst));

    let report = report.lock().unwrap();
    let (retime, rutime, stime, ctime) = (report[0], report[1], report[2], report[3]);
    let forked_at = fork_tick.load(Ordering::SeqCst) as i64;

    assert!(
        (rutime - BUSY as i64).abs() <= 2,
        "rutime {rutime} should be about {BUSY}"
    );
    assert!(
        (stime - SLEEP as i64).abs() <= 2,
        "stime {stime} should be about {SLEEP}"
    );
    assert!(retime >= 0 && retime <= 4, "retime {retime} should be small");
    assert!(
        (ctime - forked_at).abs() <= 1,
        "ctime {ctime} should be the fork tick {forked_at}"
    );
    tk.shutdown();
}

/// No lost wakeups: two processes ping-pong through a shared counter
/// and channel sleeps across two CPUs. Any lost wakeup deadlocks the
/// pair and trips the timeout.
#[test]
fn sleep_wakeup_ping_pong_two_cpus() {
    const ROUNDS: u64 = 500;

    let done = Arc::new(AtomicBool::new(false));

    let init: UserImage = {
        let done = done.clone();
        Arc::new(move |k, _| {
            let turn: Arc<SpinLock<u64>> = Arc::new(SpinLock::named("pingpong", 0));
            let ping_chan = Channel::Pid(Pid::new(u32::MAX));
            let pong_chan = Channel::Pid(Pid::new(u32::MAX - 1));

            let ping: UserImage = {
                let turn = turn.clone();
                Arc::new(move |k, _| {
                    let mut guard = turn.lock();
                    while *guard < 2 * ROUNDS {
                        if *guard % 2 == 0 {
                            *guard += 1;
                            sleep::wakeup(k, pong_chan);
                        } else {
                            guard = sleep::sleep(k, ping_chan, guard);
                        }
                    }
                    drop(guard);
                    lifecycle::exit(k)
                })
            };
            let pong: UserImage = {
                let turn = turn.clone();
                Arc::new(move |k, _| {
                    let mut guard = turn.lock();
                    while *guard < 2 * ROUNDS {
                        if *guard % 2 == 1 {
                            *guard += 1;
                            sleep::wakeup(k, ping_chan);
                        } else {
                            guard = sleep::sleep(k, pong_chan, guard);
                        }
                    }
                    drop(guard);
                    lifecycle::exit(k)
                })
            };

            sim::fork_child(k, ping).unwrap();
            sim::fork_child(k, pong).unwrap();
            lifecycle::wait(k).unwrap();
            lifecycle::wait(k).unwrap();
            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        cpus: 2,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("ping-pong scenario", TIMEOUT, || done.load(Ordering::SeqCst));
    tk.shutdown();
}
