//! The swap daemons, victim selection, and the fault hook.
//!
//! Two kernel threads serve the request queues. The swap-out daemon
//! picks a victim page by a simplified not-recently-used rule, parks the
//! victim process where nothing can dispatch or wake it, writes the page
//! out with no spin lock held, and frees the frame. The swap-in daemon
//! restores pages for faulting processes and wakes them.
//!
//! Lock order: requesters take the table lock, then a queue lock. The
//! eviction path releases both before file I/O and reacquires them in
//! the opposite order (queue, then table); that asymmetry is confined to
//! the daemons and is safe because neither side ever suspends while
//! holding a queue lock.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use muon_core::id::Pid;
use muon_core::page::{Pte, PteFlags, Vpn, PAGE_SIZE};
use muon_core::sync::SpinLockGuard;
use muon_noalloc::ringbuf::RingBuf;

use super::codec;
use super::queue::QUEUE_SLOTS;
use crate::config::{NOFILE, NPROC};
use crate::proc::{self, current_slot, sleep, Channel, ProcState, TableGuard};
use crate::{sched, vm, Kernel};

type QueueGuard = SpinLockGuard<'static, RingBuf<usize, QUEUE_SLOTS>>;

/// Spawns the two swap daemons. Called once, from the first process's
/// first return to user space.
pub(crate) fn spawn_daemons(kernel: &'static Kernel) {
    proc::create_kernel_thread(kernel, "swapout", swap_out_service)
        .expect("spawn swap-out daemon");
    proc::create_kernel_thread(kernel, "swapin", swap_in_service).expect("spawn swap-in daemon");
}

// ── Requester side ──────────────────────────────────────────────────────

/// Asks the swap-out daemon to free a frame and blocks until it has.
///
/// Must be called from process context with no spin lock held.
pub fn request_swap_out(kernel: &'static Kernel) {
    let idx = current_slot(kernel).expect("swap-out request outside a process");
    kdebug!("swap: slot {idx} queued for swap-out");

    let mut table = kernel.ptable.lock.lock();
    let mut queue = kernel.swap_out.lock.lock();
    table.procs[idx].satisfied = false;
    let queued = queue.push(idx);
    debug_assert!(queued, "swap-out queue cannot fill before the table");
    sleep::wakeup_locked(kernel, &mut table, kernel.swap_out.queue_chan);
    drop(queue);

    while !table.procs[idx].satisfied {
        table = sleep::sleep_on(kernel, Channel::SwapOutDone, table);
    }
    drop(table);
}

/// The page-fault hook: called on a not-present fault.
///
/// If the faulting page is marked swapped, records the address, queues
/// the caller to the swap-in daemon, and blocks on the caller's pid as a
/// channel until the page is back. Returns whether the fault was a swap
/// fault.
pub fn handle_page_fault(kernel: &'static Kernel, va: usize) -> bool {
    let Some(idx) = current_slot(kernel) else {
        return false;
    };
    let vpn = Vpn::containing(va);

    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    let swapped = data
        .vm
        .as_ref()
        .and_then(|vm| vm.pte(vpn))
        .is_some_and(Pte::is_swapped);
    if !swapped {
        return false;
    }
    data.trapva = va;
    kdebug!("swap: slot {idx} faulted on page {vpn}");

    let mut table = kernel.ptable.lock.lock();
    let pid = table.procs[idx].pid;
    let mut queue = kernel.swap_in.lock.lock();
    let queued = queue.push(idx);
    debug_assert!(queued, "swap-in queue cannot fill before the table");
    sleep::wakeup_locked(kernel, &mut table, kernel.swap_in.queue_chan);
    drop(queue);

    let table = sleep::sleep_on(kernel, Channel::Pid(pid), table);
    drop(table);
    true
}

// ── Swap-out daemon ─────────────────────────────────────────────────────

/// Body of the swap-out kernel thread.
fn swap_out_service(kernel: &'static Kernel) {
    let mut table = kernel.ptable.lock.lock();
    loop {
        let mut queue = kernel.swap_out.lock.lock();

        if queue.is_empty() {
            // Drained: release the requesters, then wait for work.
            sleep::wakeup_locked(kernel, &mut table, Channel::SwapOutDone);
            drop(queue);
            table = sleep::sleep_on(kernel, kernel.swap_out.queue_chan, table);
            continue;
        }

        // Quota pressure is back-pressure, not an error: let requesters
        // re-examine the world and try again after a reschedule.
        if kernel.swap.file_limit.load(Ordering::SeqCst) >= NOFILE as isize {
            sleep::wakeup_locked(kernel, &mut table, Channel::SwapOutDone);
            drop(queue);
            drop(table);
            sched::yield_cpu(kernel);
            let (q, t) = relock(kernel);
            drop(q);
            table = t;
            continue;
        }

        let requester = queue.pop().expect("non-empty swap-out queue");
        let requester_pid = table.procs[requester].pid;

        // Evict, retrying after a reschedule while no victim exists.
        loop {
            let (t, q, evicted) = choose_victim_and_evict(kernel, table, queue, requester_pid);
            table = t;
            queue = q;
            if evicted {
                break;
            }
            sleep::wakeup_locked(kernel, &mut table, Channel::SwapOutDone);
            drop(queue);
            drop(table);
            sched::yield_cpu(kernel);
            let (q, t) = relock(kernel);
            queue = q;
            table = t;
        }

        table.procs[requester].satisfied = true;
        drop(queue);
    }
}

/// Reacquires the swap-out queue and table locks in the daemon's order.
fn relock(kernel: &'static Kernel) -> (QueueGuard, TableGuard) {
    let queue = kernel.swap_out.lock.lock();
    let table = kernel.ptable.lock.lock();
    (queue, table)
}

/// One page out. Returns the reacquired guards and whether a victim was
/// found and evicted.
///
/// With both locks held: pick the victim, stash its `(state, chan)`,
/// force it SLEEPING on no channel so it can neither run nor be woken,
/// and publish the swapped PTE. Both locks are then dropped for the file
/// write and reacquired (queue, then table) to free the frame, flush the
/// victim's translations, and restore its `(state, chan)`.
fn choose_victim_and_evict(
    kernel: &'static Kernel,
    mut table: TableGuard,
    queue: QueueGuard,
    requester: Pid,
) -> (TableGuard, QueueGuard, bool) {
    // One candidate per replacement class, last match wins; the lowest
    // non-empty class is the victim.
    let mut candidates: [Option<(usize, Vpn)>; 4] = [None; 4];
    for idx in 0..NPROC {
        let shared = &table.procs[idx];
        if matches!(
            shared.state,
            ProcState::Unused | ProcState::Embryo | ProcState::Running
        ) {
            continue;
        }
        if shared.kthread || Some(idx) == table.init_slot || shared.pid == requester {
            continue;
        }
        // SAFETY: not RUNNING, and the table lock is held for the whole
        // look, so the slot cannot be dispatched underneath us.
        let data = unsafe { kernel.ptable.slot(idx).data_mut() };
        let Some(space) = data.vm.as_ref() else {
            continue;
        };
        for n in 1..vm::page_count(data.sz) {
            let vpn = Vpn::new(n);
            let Some(pte) = space.pte(vpn) else {
                continue;
            };
            if !pte.is_present() || !pte.is_user() {
                continue;
            }
            candidates[pte.replacement_class()] = Some((idx, vpn));
        }
    }

    let Some((victim_idx, vpn)) = candidates.iter().flatten().next().copied() else {
        return (table, queue, false);
    };

    // Park the victim where neither the scheduler nor any waker can
    // reach it; that is the only thing protecting it across the unlocked
    // window below.
    let shared = &mut table.procs[victim_idx];
    let orig_state = shared.state;
    let orig_chan = shared.chan.take();
    shared.state = ProcState::Sleeping;
    let victim_pid = shared.pid;

    // SAFETY: the victim is parked; only this daemon touches it until
    // its state is restored.
    let victim_data = unsafe { kernel.ptable.slot(victim_idx).data_mut() };
    let space = victim_data.vm.as_mut().expect("victim without a space");
    let pte = space.pte(vpn).expect("victim pte vanished");
    space.set_pte(vpn, pte.mark_swapped());

    // File I/O happens with no spin lock held.
    drop(queue);
    drop(table);

    if orig_state != ProcState::Zombie {
        // SAFETY: the frame stays ours until freed below; the victim
        // cannot touch it while parked.
        let bytes = unsafe {
            core::slice::from_raw_parts(kernel.frames.frame_bytes(pte.frame()), PAGE_SIZE)
        };
        let my_idx = current_slot(kernel).expect("eviction outside a process");
        // SAFETY: the daemon's own descriptor table.
        let my_data = unsafe { kernel.ptable.slot(my_idx).data_mut() };
        if let Err(err) = codec::write_page(kernel, my_data, victim_pid, vpn, bytes) {
            kerr!("swap: writing page {vpn} of pid {victim_pid} failed: {err}");
        }
    }

    let queue = kernel.swap_out.lock.lock();
    let mut table = kernel.ptable.lock.lock();

    kernel.frames.free_frame(pte.frame());
    // SAFETY: victim still parked until the state restore below.
    let victim_data = unsafe { kernel.ptable.slot(victim_idx).data_mut() };
    kernel
        .machine
        .flush_address_space(victim_data.vm.as_deref().expect("victim without a space"));

    {
        let shared = &mut table.procs[victim_idx];
        shared.state = orig_state;
        shared.chan = orig_chan;
    }

    // Wakeups aimed at the victim while it was parked scanned right past
    // it. Every sleep site re-checks its condition in a loop, so
    // re-delivering is safe — and without it a parent that scanned while
    // its zombie child was parked would wait forever.
    match orig_state {
        ProcState::Zombie => {
            if let Some(parent_idx) = table.procs[victim_idx].parent {
                sleep::wakeup_locked(kernel, &mut table, Channel::Proc(parent_idx));
            }
        }
        ProcState::Sleeping => {
            if let Some(chan) = orig_chan {
                sleep::wakeup_locked(kernel, &mut table, chan);
            }
        }
        _ => {}
    }

    (table, queue, true)
}

// ── Swap-in daemon ──────────────────────────────────────────────────────

/// Body of the swap-in kernel thread.
fn swap_in_service(kernel: &'static Kernel) {
    let mut table = kernel.ptable.lock.lock();
    loop {
        let mut queue = kernel.swap_in.lock.lock();

        let Some(requester) = queue.pop() else {
            drop(queue);
            table = sleep::sleep_on(kernel, kernel.swap_in.queue_chan, table);
            continue;
        };

        let pid = table.procs[requester].pid;
        kernel.swap.file_limit.fetch_sub(1, Ordering::SeqCst);
        // SAFETY: the requester sleeps on its pid channel until we wake
        // it below.
        let req_data = unsafe { kernel.ptable.slot(requester).data_mut() };
        let vpn = Vpn::containing(req_data.trapva);

        drop(queue);
        drop(table);

        // A frame for the page; queue behind the out-daemon if the pool
        // is dry.
        let frame = vm::alloc_frame_blocking(kernel);
        let read_ok = {
            let my_idx = current_slot(kernel).expect("swap-in outside a process");
            // SAFETY: the daemon's own descriptor table.
            let my_data = unsafe { kernel.ptable.slot(my_idx).data_mut() };
            // SAFETY: the frame was just allocated; nothing references it.
            let buf = unsafe {
                core::slice::from_raw_parts_mut(kernel.frames.frame_bytes(frame), PAGE_SIZE)
            };
            match codec::read_page(kernel, my_data, pid, vpn, buf) {
                Ok(()) => true,
                Err(err) => {
                    kerr!("swap: reading page {vpn} of pid {pid} failed: {err}");
                    false
                }
            }
        };

        let queue = kernel.swap_in.lock.lock();
        table = kernel.ptable.lock.lock();

        // SAFETY: requester still parked on its pid channel.
        let req_data = unsafe { kernel.ptable.slot(requester).data_mut() };
        let space = req_data.vm.as_mut().expect("swap-in requester without a space");
        // A killed waiter can re-fault and queue the same page twice; only
        // the request that still sees a swapped entry installs.
        let old = space.pte(vpn);
        if read_ok && old.is_some_and(Pte::is_swapped) {
            let old = old.expect("checked above");
            space.set_pte(
                vpn,
                Pte::new(
                    frame,
                    old.flags().difference(PteFlags::SWAPPED) | PteFlags::PRESENT,
                ),
            );
        } else {
            kernel.frames.free_frame(frame);
        }

        sleep::wakeup_locked(kernel, &mut table, Channel::Pid(pid));
        drop(queue);
    }
}

// ── Lifecycle cleanup ───────────────────────────────────────────────────

/// Releases the swap files still held open by the swap daemons and
/// reports the swap traffic since the last purge.
///
/// Runs when a process whose parent is the shell exits. The daemons are
/// found by name; only an idle (sleeping) daemon's descriptor table is
/// touched.
pub fn purge_swap_files(kernel: &Kernel) {
    let mut stale: Vec<String> = Vec::new();
    {
        let table = kernel.ptable.lock.lock();
        for idx in 0..NPROC {
            let shared = &table.procs[idx];
            if !shared.kthread || shared.state != ProcState::Sleeping {
                continue;
            }
            // SAFETY: a sleeping kernel thread is off-CPU and the table
            // lock is held for the whole edit.
            let data = unsafe { kernel.ptable.slot(idx).data_mut() };
            if data.name != "swapout" && data.name != "swapin" {
                continue;
            }
            for slot in data.ofile.iter_mut() {
                if slot.as_ref().is_some_and(|f| f.path().ends_with(".swp")) {
                    let file = slot.take().expect("checked above");
                    stale.push(file.path().to_string());
                }
            }
        }
    }

    let mut purged = 0usize;
    for path in &stale {
        if codec::delete_page(kernel, path).is_ok() {
            kernel.swap.file_limit.fetch_sub(1, Ordering::SeqCst);
            purged += 1;
        }
    }

    let outs = kernel.swap.out_count.swap(0, Ordering::SeqCst);
    let ins = kernel.swap.in_count.swap(0, Ordering::SeqCst);
    kinfo!("swap: {outs} pages out, {ins} pages in, {purged} files purged");
}
