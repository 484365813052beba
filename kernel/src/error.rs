//! Error types for the virtual memory core
//!
//! One crate-wide error enum with struct variants carrying enough context
//! to print a useful diagnostic at the point where an operation finally
//! fails (usually the page-fault handler, which converts errors into
//! process termination).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The user-frame pool and eviction could not produce memory
    OutOfMemory {
        requested: usize,
    },
    /// Address outside the range the operation accepts
    InvalidAddress {
        addr: usize,
    },
    /// No supplemental page table entry describes this page
    UnmappedMemory {
        addr: usize,
    },
    /// The access is not permitted by the mapping
    PermissionDenied {
        operation: &'static str,
    },
    /// A supplemental page table entry already exists for this page
    AlreadyExists {
        addr: usize,
    },
    /// Reading page contents from the backing file failed or came up short
    IoError {
        expected: usize,
        got: usize,
    },
    /// Process lookup failed
    ProcessNotFound {
        pid: u64,
    },
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied for operation: {}", operation)
            }
            Self::AlreadyExists { addr } => {
                write!(f, "Page at {:#x} is already registered", addr)
            }
            Self::IoError { expected, got } => {
                write!(f, "I/O error: expected {} bytes, got {}", expected, got)
            }
            Self::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::UnmappedMemory { addr: 0x8048000 };
        assert_eq!(alloc::format!("{}", err), "Unmapped memory at 0x8048000");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            KernelError::InvalidAddress { addr: 0x1000 },
            KernelError::InvalidAddress { addr: 0x1000 }
        );
        assert_ne!(
            KernelError::InvalidAddress { addr: 0x1000 },
            KernelError::UnmappedMemory { addr: 0x1000 }
        );
    }
}
