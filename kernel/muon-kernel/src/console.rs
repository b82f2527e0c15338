//! Console-side kernel state: the command history ring and the Ctrl-P
//! debug hook.
//!
//! The shell reports each accepted command line via
//! [`Console::record_command`]; the `history` syscall reads slots back,
//! newest first. Ctrl-P on the console dumps the process table.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};

use muon_core::sync::SpinLock;

use crate::config::HISTORY_DEPTH;
use crate::proc;
use crate::Kernel;

/// Outcome of a history lookup that found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    /// The slot exists but holds no command yet.
    EmptySlot,
    /// The id is beyond the history depth.
    OutOfRange,
}

/// Console state.
pub struct Console {
    history: SpinLock<VecDeque<String>>,
}

impl Console {
    /// Creates a console with empty history.
    pub const fn new() -> Self {
        Self {
            history: SpinLock::named("console", VecDeque::new()),
        }
    }

    /// Records an accepted command line, newest first; the oldest entry
    /// falls off past [`HISTORY_DEPTH`].
    pub fn record_command(&self, command: &str) {
        let mut history = self.history.lock();
        history.push_front(command.to_string());
        history.truncate(HISTORY_DEPTH);
    }

    /// Returns the `id`-th most recent command (0 = newest).
    pub fn command(&self, id: usize) -> Result<String, HistoryError> {
        if id >= HISTORY_DEPTH {
            return Err(HistoryError::OutOfRange);
        }
        let history = self.history.lock();
        history.get(id).cloned().ok_or(HistoryError::EmptySlot)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Console control-key dispatch: Ctrl-P dumps the process list.
pub fn handle_ctrl_key(kernel: &Kernel, key: u8) {
    const CTRL_P: u8 = 0x10;
    if key == CTRL_P {
        proc::proc_dump(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_command_is_slot_zero() {
        let console = Console::new();
        console.record_command("ls");
        console.record_command("cat README");
        assert_eq!(console.command(0).unwrap(), "cat README");
        assert_eq!(console.command(1).unwrap(), "ls");
    }

    #[test]
    fn empty_slot_vs_out_of_range() {
        let console = Console::new();
        console.record_command("only");
        assert_eq!(console.command(1), Err(HistoryError::EmptySlot));
        assert_eq!(
            console.command(HISTORY_DEPTH),
            Err(HistoryError::OutOfRange)
        );
    }

    #[test]
    fn depth_is_bounded() {
        let console = Console::new();
        for i in 0..HISTORY_DEPTH + 5 {
            console.record_command(&alloc::format!("cmd{i}"));
        }
        // Newest survives, oldest fell off.
        assert_eq!(
            console.command(0).unwrap(),
            alloc::format!("cmd{}", HISTORY_DEPTH + 4)
        );
        assert!(console.command(HISTORY_DEPTH - 1).is_ok());
    }
}
