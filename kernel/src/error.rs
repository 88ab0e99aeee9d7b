//! Kernel Error Types
//!
//! Recoverable request errors. Every variant has a stable negative code
//! that system calls hand back to user space in `eax`.

use core::fmt;

/// Recoverable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Resource handle is unknown or names the wrong kind of resource.
    InvalidId,
    /// Path or object could not be found.
    NotFound,
    /// Request is not possible in the current state or window.
    NotPossible,
    /// Process was terminated by a disallowed page fault.
    PageFault,
    /// Argument is malformed or out of range.
    InvalidArgument,
    /// Resource table has no free slot.
    TableFull,
    /// Program image is not a loadable ELF32 executable.
    BadExecutable,
    /// User pointer does not reference accessible user memory.
    BadAddress,
}

/// Result alias used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Negative code reported to user space.
    pub const fn code(self) -> i64 {
        match self {
            KernelError::InvalidId => -1,
            KernelError::NotFound => -2,
            KernelError::NotPossible => -3,
            KernelError::PageFault => -4,
            KernelError::InvalidArgument => -5,
            KernelError::TableFull => -6,
            KernelError::BadExecutable => -7,
            KernelError::BadAddress => -8,
        }
    }

    /// Inverse of [`KernelError::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        let err = match code {
            -1 => KernelError::InvalidId,
            -2 => KernelError::NotFound,
            -3 => KernelError::NotPossible,
            -4 => KernelError::PageFault,
            -5 => KernelError::InvalidArgument,
            -6 => KernelError::TableFull,
            -7 => KernelError::BadExecutable,
            -8 => KernelError::BadAddress,
            _ => return None,
        };
        Some(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidId => write!(f, "invalid resource id"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::NotPossible => write!(f, "operation not possible"),
            KernelError::PageFault => write!(f, "page fault"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::TableFull => write!(f, "resource table full"),
            KernelError::BadExecutable => write!(f, "bad executable"),
            KernelError::BadAddress => write!(f, "bad user address"),
        }
    }
}
