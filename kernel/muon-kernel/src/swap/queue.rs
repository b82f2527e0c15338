//! Swap request queues.
//!
//! Each daemon owns one bounded FIFO of process-slot indices behind its
//! own spin lock, plus the channel it sleeps on while the queue is
//! empty. Requesters enqueue themselves, wake the daemon's channel, and
//! sleep until served.

use muon_core::sync::SpinLock;
use muon_noalloc::ringbuf::RingBuf;

use crate::config::NPROC;
use crate::proc::Channel;

/// Ring storage: `NPROC + 1` slots hold every process at once.
pub const QUEUE_SLOTS: usize = NPROC + 1;

/// One swap request queue.
pub struct SwapQueue {
    /// The FIFO of requester slot indices.
    pub lock: SpinLock<RingBuf<usize, QUEUE_SLOTS>>,
    /// Channel the daemon sleeps on for "queue non-empty".
    pub queue_chan: Channel,
}

impl SwapQueue {
    /// Creates an empty queue whose daemon sleeps on `queue_chan`.
    pub const fn new(name: &'static str, queue_chan: Channel) -> Self {
        Self {
            lock: SpinLock::named(name, RingBuf::new()),
            queue_chan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_every_process_slot() {
        let queue = SwapQueue::new("test.queue", Channel::SwapOutQueue);
        let mut buf = queue.lock.lock();
        for idx in 0..NPROC {
            assert!(buf.push(idx), "queue refused slot {idx}");
        }
        assert_eq!(buf.len(), NPROC);
        for idx in 0..NPROC {
            assert_eq!(buf.pop(), Some(idx));
        }
    }
}
