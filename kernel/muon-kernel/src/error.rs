//! Kernel error types.
//!
//! Fallible kernel operations carry a [`KernelError`]; the syscall
//! dispatcher is the only layer that flattens them to `-1`. Invariant
//! violations are not errors — they panic.

use core::fmt;

use crate::fs::FsError;

/// Errors that can occur during kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The process table has no free slot.
    OutOfProcSlots,
    /// No physical frame or kernel stack could be allocated.
    OutOfMemory,
    /// The per-process descriptor table is full.
    OutOfDescriptors,
    /// An argument was out of range.
    InvalidArgument,
    /// A user address was unmapped or not user-accessible.
    BadAddress,
    /// The calling process has been killed.
    Killed,
    /// `wait` was called with no children to reap.
    NoChildren,
    /// No process with the given pid exists.
    NoSuchProcess,
    /// A filesystem operation failed.
    Fs(FsError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfProcSlots => f.write_str("no free process slot"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::OutOfDescriptors => f.write_str("no free file descriptor"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::BadAddress => f.write_str("bad user address"),
            Self::Killed => f.write_str("process killed"),
            Self::NoChildren => f.write_str("no children"),
            Self::NoSuchProcess => f.write_str("no such process"),
            Self::Fs(err) => write!(f, "filesystem: {err}"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        assert_eq!(format!("{}", KernelError::OutOfProcSlots), "no free process slot");
        assert_eq!(format!("{}", KernelError::NoChildren), "no children");
        assert_eq!(
            format!("{}", KernelError::Fs(FsError::NotFound)),
            "filesystem: not found"
        );
    }

    #[test]
    fn fs_error_converts() {
        let err: KernelError = FsError::NotFound.into();
        assert_eq!(err, KernelError::Fs(FsError::NotFound));
    }
}
