//! End-to-end scenarios over the simulated machine.
//!
//! Every test boots a fresh kernel, installs an init image that drives
//! the scenario, and watches results through shared atomics from the
//! host side — assertions live on the host thread so a failing scenario
//! shows up as a timeout or a plain assert, never a wedged machine.

mod proc;
mod sched;
mod swap;
mod syscalls;
