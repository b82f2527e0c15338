//! Swap scenarios: the codec round trip and eviction/restoration under
//! a tight frame pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec;
use std::vec::Vec;

use muon_core::page::{Vpn, PAGE_SIZE};

use crate::hw::{FrameAlloc, UserImage};
use crate::proc::{self, lifecycle};
use crate::sim::{self, SimConfig};
use crate::swap::codec;
use crate::syscall;

const TIMEOUT: Duration = Duration::from_secs(60);

/// Swap files round-trip byte-identical contents and are unlinked after
/// consumption.
#[test]
fn swap_codec_round_trip() {
    let done = Arc::new(AtomicBool::new(false));
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let init: UserImage = {
        let done = done.clone();
        let failures = failures.clone();
        Arc::new(move |k, _| {
            let idx = proc::current_slot(k).unwrap();
            // SAFETY: init's own data.
            let data = unsafe { k.ptable.slot(idx).data_mut() };
            let pid = proc::current_pid(k).unwrap();
            let vpn = Vpn::new(3);

            let mut page = vec![0u8; PAGE_SIZE];
            for (i, byte) in page.iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }

            let mut check = |ok: bool, what: &str| {
                if !ok {
                    failures.lock().unwrap().push(what.into());
                }
            };

            check(
                codec::write_page(k, data, pid, vpn, &page).is_ok(),
                "write_page",
            );
            check(
                k.fs.open(&codec::swap_file_name(pid, vpn)).is_ok(),
                "file exists after write",
            );

            let mut back = vec![0u8; PAGE_SIZE];
            check(
                codec::read_page(k, data, pid, vpn, &mut back).is_ok(),
                "read_page",
            );
            check(back == page, "round trip is byte-identical");
            check(
                k.fs.open(&codec::swap_file_name(pid, vpn)).is_err(),
                "file unlinked after read",
            );

            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let tk = sim::boot(SimConfig::default(), init);
    tk.wait_until("codec scenario", TIMEOUT, || done.load(Ordering::SeqCst));
    assert!(failures.lock().unwrap().is_empty(), "{:?}", failures.lock().unwrap());
    tk.shutdown();
}

/// Scenario 6: more memory-hungry children than the frame pool holds.
/// Every child sees its own bytes despite eviction; the number of swap
/// files on disk matches the pages currently evicted; the purge pass
/// clears them.
#[test]
fn swap_round_trip_under_frame_pressure() {
    const CHILDREN: usize = 3;
    const PAGES: usize = 4;

    let done = Arc::new(AtomicBool::new(false));
    let verified = Arc::new(AtomicUsize::new(0));
    let corruptions = Arc::new(AtomicUsize::new(0));
    let file_accounting: Arc<Mutex<Vec<(usize, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let files_after_purge = Arc::new(AtomicUsize::new(usize::MAX));

    let init: UserImage = {
        let done = done.clone();
        let verified = verified.clone();
        let corruptions = corruptions.clone();
        let file_accounting = file_accounting.clone();
        let files_after_purge = files_after_purge.clone();
        Arc::new(move |k, _| {
            for seed in 0..CHILDREN as u8 {
                let verified = verified.clone();
                let corruptions = corruptions.clone();
                let child: UserImage = Arc::new(move |k, _| {
                    let base =
                        syscall::dispatch(k, syscall::SYS_SBRK, [PAGES * PAGE_SIZE, 0, 0, 0]);
                    assert!(base > 0, "sbrk must succeed under frame pressure");
                    let base = base as usize;

                    let idx = proc::current_slot(k).unwrap();
                    // SAFETY: the child's own data.
                    let data = unsafe { k.ptable.slot(idx).data_mut() };

                    // Stamp every page with a distinct pattern, then let
                    // the siblings run so the demand overlaps and the
                    // pool actually runs dry.
                    for page in 0..PAGES {
                        let pattern = vec![seed * 16 + page as u8 + 1; PAGE_SIZE];
                        crate::vm::copy_out(k, data, base + page * PAGE_SIZE, &pattern)
                            .expect("store to own memory");
                    }
                    syscall::dispatch(k, syscall::SYS_YIELD, [0; 4]);

                    // Re-read repeatedly; evicted pages fault back in.
                    for _round in 0..3 {
                        for page in 0..PAGES {
                            let expected = vec![seed * 16 + page as u8 + 1; PAGE_SIZE];
                            let mut got = vec![0u8; PAGE_SIZE];
                            crate::vm::copy_in(k, data, base + page * PAGE_SIZE, &mut got)
                                .expect("load from own memory");
                            if got != expected {
                                corruptions.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        syscall::dispatch(k, syscall::SYS_YIELD, [0; 4]);
                    }

                    verified.fetch_add(1, Ordering::SeqCst);
                    lifecycle::exit(k)
                });
                sim::fork_child(k, child).unwrap();
            }

            for _ in 0..CHILDREN {
                lifecycle::wait(k).unwrap();
            }

            // Steady state: files on disk == pages written out and not
            // yet read back.
            let outs = k.swap.out_count.load(Ordering::SeqCst);
            let ins = k.swap.in_count.load(Ordering::SeqCst);
            let on_disk = codec::swap_files_on_disk(k).len();
            file_accounting.lock().unwrap().push((outs, ins, on_disk));

            crate::swap::daemon::purge_swap_files(k);
            files_after_purge.store(codec::swap_files_on_disk(k).len(), Ordering::SeqCst);

            done.store(true, Ordering::SeqCst);
            sim::park_forever(k)
        })
    };

    let config = SimConfig {
        frames: CHILDREN * PAGES - 2,
        ..SimConfig::default()
    };
    let tk = sim::boot(config, init);
    tk.wait_until("swap pressure scenario", TIMEOUT, || {
        done.load(Ordering::SeqCst)
    });

    assert_eq!(verified.load(Ordering::SeqCst), CHILDREN);
    assert_eq!(
        corruptions.load(Ordering::SeqCst),
        0,
        "restored pages must be byte-identical"
    );

    let accounting = file_accounting.lock().unwrap();
    let (outs, ins, on_disk) = accounting[0];
    assert!(outs > 0, "the tight pool must force evictions");
    assert_eq!(
        on_disk,
        outs - ins,
        "swap files on disk must equal currently-evicted pages"
    );
    assert_eq!(
        files_after_purge.load(Ordering::SeqCst),
        0,
        "purge removes every swap file"
    );

    // Eviction flushed the victims' translations, and every frame came
    // back once the children were reaped.
    assert!(tk.machine.flushes() > 0);
    assert_eq!(tk.frames.free_frames(), CHILDREN * PAGES - 2);

    tk.shutdown();
}
