//! Fixed-capacity data structures for contexts that cannot allocate.
//!
//! Kernel primitives — request queues drained with spin locks held —
//! cannot go through the heap. The types here store their elements
//! inline in a fixed-size array and work in `no_std` environments:
//!
//! - [`ringbuf::RingBuf`] — a fixed-capacity FIFO ring buffer
//!
//! # Examples
//!
//! ```
//! use muon_noalloc::ringbuf::RingBuf;
//!
//! // A ring with storage for 8 slots holds up to 7 queued elements.
//! let mut queue = RingBuf::<u32, 8>::new();
//! queue.push(1);
//! queue.push(2);
//! assert_eq!(queue.pop(), Some(1));
//! assert_eq!(queue.len(), 1);
//! ```

#![no_std]

pub mod ringbuf;
