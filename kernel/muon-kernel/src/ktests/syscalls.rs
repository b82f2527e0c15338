//! Dispatcher scenarios: the auxiliary syscalls and the adapter's error
//! flattening.

use std::format;
use std::string::String;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec;
use std::vec::Vec;

use muon_core::page::PAGE_SIZE;

use crate::hw::UserImage;
use crate::proc;
use crate::sim::{self, SimConfig};
use crate::syscall::{self, BANNER};

const TIMEOUT: Duration = Duration::from_secs(30);

#[test]
fn auxiliary_syscalls_behave() {
    let done = Arc::new(AtomicBool::new(false));
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let failures = failures.clone();
        Arc::new(move |k, _| {
            let mut check = |ok: bool, what: String| {
                if !ok {
                    failures.lock().unwrap().push(what);
                }
            };

            // A page of user memory for the buffers.
            let base = syscall::dispatch(k, syscall::SYS_SBRK, [PAGE_SIZE, 0, 0, 0]);
            check(base == PAGE_SIZE as isize, format!("sbrk returned {base}"));
            let va = base as usize;

            let idx = proc::current_slot(k).unwrap();

            // getpid: init is pid 1.
            let pid = syscall::dispatch(k, syscall::SYS_GETPID, [0; 4]);
            check(pid == 1, format!("getpid returned {pid}"));

            // draw: banner plus NUL, rejected when the buffer is small.
            let n = syscall::dispatch(k, syscall::SYS_DRAW, [va, PAGE_SIZE, 0, 0]);
            check(
                n == (BANNER.len() + 1) as isize,
                format!("draw returned {n}"),
            );
            let mut buf = vec![0u8; BANNER.len() + 1];
            // SAFETY: init's own data.
            let data = unsafe { k.ptable.slot(idx).data_mut() };
            crate::vm::copy_in(k, data, va, &mut buf).unwrap();
            check(&buf[..BANNER.len()] == BANNER.as_bytes(), "draw bytes".into());
            check(buf[BANNER.len()] == 0, "draw NUL terminator".into());
            let small = syscall::dispatch(k, syscall::SYS_DRAW, [va, 4, 0, 0]);
            check(small == -1, format!("short draw returned {small}"));

            // history: 0 = newest, 1 = empty slot, 2 = out of range.
            k.console.record_command("cat README");
            let rc = syscall::dispatch(k, syscall::SYS_HISTORY, [va, 0, 0, 0]);
            check(rc == 0, format!("history hit returned {rc}"));
            let mut cmd = vec![0u8; "cat README".len() + 1];
            // SAFETY: init's own data.
            let data = unsafe { k.ptable.slot(idx).data_mut() };
            crate::vm::copy_in(k, data, va, &mut cmd).unwrap();
            check(
                &cmd[.."cat README".len()] == b"cat README",
                "history bytes".into(),
            );
            let rc = syscall::dispatch(k, syscall::SYS_HISTORY, [va, 7, 0, 0]);
            check(rc == 1, format!("empty slot returned {rc}"));
            let rc = syscall::dispatch(
                k,
                syscall::SYS_HISTORY,
                [va, crate::config::HISTORY_DEPTH, 0, 0],
            );
            check(rc == 2, format!("out of range returned {rc}"));

            // uptime moves with the clock.
            let before = syscall::dispatch(k, syscall::SYS_UPTIME, [0; 4]);
            sim::spin_ticks(k, 3);
            let after = syscall::dispatch(k, syscall::SYS_UPTIME, [0; 4]);
            check(
                after >= before + 3,
                format!("uptime {before} -> {after}"),
            );

            // set_prio validates its range.
            check(
                syscall::dispatch(k, syscall::SYS_SET_PRIO, [5, 0, 0, 0]) != 0,
                "set_prio(5) must fail".into(),
            );
            check(
                syscall::dispatch(k, syscall::SYS_SET_PRIO, [2, 0, 0, 0]) == 0,
                "set_prio(2) must succeed".into(),
            );

            // sleep rejects a negative count.
            let rc = syscall::dispatch(k, syscall::SYS_SLEEP, [usize::MAX, 0, 0, 0]);
            check(rc == -1, format!("sleep(-1) returned {rc}"));

            // yield is a no-op success with nothing else runnable.
            check(
                syscall::dispatch(k, syscall::SYS_YIELD, [0; 4]) == 0,
                "yield".into(),
            );

            // kill of a pid nobody has flattens to -1.
            check(
                syscall::dispatch(k, syscall::SYS_KILL, [9999, 0, 0, 0]) == -1,
                "kill of unknown pid".into(),
            );

            // Unknown numbers flatten to -1.
            check(
                syscall::dispatch(k, 999, [0; 4]) == -1,
                "unknown syscall".into(),
            );

            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("syscall scenario", TIMEOUT, || done.load(Ordering::SeqCst));
    assert!(
        failures.lock().unwrap().is_empty(),
        "{:?}",
        failures.lock().unwrap()
    );
    tk.shutdown();
}
