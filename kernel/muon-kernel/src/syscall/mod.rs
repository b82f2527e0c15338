//! System-call dispatch: the thin adapter between user mode and the
//! kernel operations.
//!
//! Numbers are stable ABI. Handlers decode arguments, call the
//! operations in [`proc`], [`sched`], and [`vm`], and flatten errors to
//! `-1` (except `history`, whose 1/2 return codes are results, not
//! errors).

use muon_core::id::Pid;

use crate::console::HistoryError;
use crate::proc::{self, current_slot, lifecycle, sleep, Channel};
use crate::{sched, vm, Kernel};

/// `fork()` — create a child process.
pub const SYS_FORK: usize = 1;
/// `exit()` — terminate the caller.
pub const SYS_EXIT: usize = 2;
/// `wait()` — reap a child, returning its pid.
pub const SYS_WAIT: usize = 3;
/// `kill(pid)` — mark a process killed.
pub const SYS_KILL: usize = 6;
/// `getpid()` — caller's pid.
pub const SYS_GETPID: usize = 11;
/// `sbrk(n)` — grow or shrink the address space.
pub const SYS_SBRK: usize = 12;
/// `sleep(n)` — block for `n` ticks.
pub const SYS_SLEEP: usize = 13;
/// `uptime()` — ticks since boot.
pub const SYS_UPTIME: usize = 14;
/// `yield()` — give up the CPU for one round.
pub const SYS_YIELD: usize = 22;
/// `wait2(&retime, &rutime, &stime, &ctime)` — wait, capturing stats.
pub const SYS_WAIT2: usize = 23;
/// `set_prio(p)` — set the caller's priority.
pub const SYS_SET_PRIO: usize = 24;
/// `draw(buf, size)` — copy the kernel banner into a user buffer.
pub const SYS_DRAW: usize = 25;
/// `history(buf, id)` — fetch a recorded console command.
pub const SYS_HISTORY: usize = 26;

/// The kernel banner `draw` hands out.
pub const BANNER: &str = concat!(
    "  .--------------------------------------.\n",
    "  |    _ __ ___  _   _  ___  _ __        |\n",
    "  |   | '_ ` _ \\| | | |/ _ \\| '_ \\       |\n",
    "  |   | | | | | | |_| | (_) | | | |      |\n",
    "  |   |_| |_| |_|\\__,_|\\___/|_| |_|      |\n",
    "  '--------------------------------------'\n",
);

/// Dispatches syscall `num` with raw arguments `args`.
pub fn dispatch(kernel: &'static Kernel, num: usize, args: [usize; 4]) -> isize {
    match num {
        SYS_FORK => match lifecycle::fork(kernel) {
            Ok(pid) => pid.as_u32() as isize,
            Err(_) => -1,
        },
        SYS_EXIT => lifecycle::exit(kernel),
        SYS_WAIT => match lifecycle::wait(kernel) {
            Ok(pid) => pid.as_u32() as isize,
            Err(_) => -1,
        },
        SYS_KILL => match sleep::kill(kernel, Pid::new(args[0] as u32)) {
            Ok(()) => 0,
            Err(_) => -1,
        },
        SYS_GETPID => match proc::current_pid(kernel) {
            Some(pid) => pid.as_u32() as isize,
            None => -1,
        },
        SYS_SBRK => sys_sbrk(kernel, args[0] as isize),
        SYS_SLEEP => sys_sleep(kernel, args[0] as isize),
        SYS_UPTIME => *kernel.time.ticks.lock() as isize,
        SYS_YIELD => {
            sched::yield_cpu(kernel);
            0
        }
        SYS_WAIT2 => sys_wait2(kernel, args),
        SYS_SET_PRIO => match lifecycle::set_prio(kernel, args[0] as i64) {
            Ok(()) => 0,
            Err(_) => -1,
        },
        SYS_DRAW => sys_draw(kernel, args[0], args[1]),
        SYS_HISTORY => sys_history(kernel, args[0], args[1]),
        _ => {
            kwarn!("unknown syscall {num}");
            -1
        }
    }
}

/// Grows the address space by `n` bytes, returning the old break.
fn sys_sbrk(kernel: &'static Kernel, n: isize) -> isize {
    match lifecycle::growproc(kernel, n) {
        Ok(old_sz) => old_sz as isize,
        Err(_) => -1,
    }
}

/// Blocks for `n` ticks. A killed caller returns early with `-1`.
fn sys_sleep(kernel: &'static Kernel, n: isize) -> isize {
    if n < 0 {
        return -1;
    }
    let n = n as u64;
    let mut ticks = kernel.time.ticks.lock();
    let start = *ticks;
    while *ticks - start < n {
        if proc::current_killed(kernel) {
            return -1;
        }
        ticks = sleep::sleep(kernel, Channel::Ticks, ticks);
    }
    0
}

/// Waits for a child and writes its timing counters through the four
/// user pointers (a null pointer skips that counter).
fn sys_wait2(kernel: &'static Kernel, args: [usize; 4]) -> isize {
    let (pid, stats) = match lifecycle::waitstats(kernel) {
        Ok(reaped) => reaped,
        Err(_) => return -1,
    };

    let idx = current_slot(kernel).expect("wait2 without a process");
    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    let values = [stats.retime, stats.rutime, stats.stime, stats.ctime];
    for (va, value) in args.into_iter().zip(values) {
        if va == 0 {
            continue;
        }
        if vm::copy_out(kernel, data, va, &(value as i64).to_le_bytes()).is_err() {
            return -1;
        }
    }
    pid.as_u32() as isize
}

/// Copies the kernel banner (and its terminating NUL) to `va`. Returns
/// bytes copied, or `-1` if `size` is too small or the buffer is bad.
fn sys_draw(kernel: &'static Kernel, va: usize, size: usize) -> isize {
    let banner = BANNER.as_bytes();
    let needed = banner.len() + 1;
    if size < needed {
        return -1;
    }

    let idx = current_slot(kernel).expect("draw without a process");
    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    if vm::copy_out(kernel, data, va, banner).is_err() {
        return -1;
    }
    if vm::copy_out(kernel, data, va + banner.len(), &[0]).is_err() {
        return -1;
    }
    needed as isize
}

/// Copies the `id`-th most recent console command (NUL-terminated) to
/// `va`. Returns 0 on success, 1 for an empty slot, 2 for an id out of
/// range.
fn sys_history(kernel: &'static Kernel, va: usize, id: usize) -> isize {
    let command = match kernel.console.command(id) {
        Ok(command) => command,
        Err(HistoryError::EmptySlot) => return 1,
        Err(HistoryError::OutOfRange) => return 2,
    };

    let idx = current_slot(kernel).expect("history without a process");
    // SAFETY: the caller's own data.
    let data = unsafe { kernel.ptable.slot(idx).data_mut() };
    if vm::copy_out(kernel, data, va, command.as_bytes()).is_err() {
        return -1;
    }
    if vm::copy_out(kernel, data, va + command.len(), &[0]).is_err() {
        return -1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_distinct() {
        let nums = [
            SYS_FORK,
            SYS_EXIT,
            SYS_WAIT,
            SYS_KILL,
            SYS_GETPID,
            SYS_SBRK,
            SYS_SLEEP,
            SYS_UPTIME,
            SYS_YIELD,
            SYS_WAIT2,
            SYS_SET_PRIO,
            SYS_DRAW,
            SYS_HISTORY,
        ];
        for (i, a) in nums.iter().enumerate() {
            for b in &nums[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn banner_is_plain_ascii() {
        assert!(BANNER.is_ascii());
        assert!(BANNER.len() > 64, "banner should be a real drawing");
    }
}
