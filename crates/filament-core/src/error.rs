//! Error types for the filament runtime
//!
//! Recoverable faults (resource exhaustion, failed syscalls) are reported
//! through [`RuntimeError`]. Invariant violations are not: those are
//! programming faults and fail fast with `assert!`/`panic!` at the site
//! that detected them.

use std::io;

use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur in runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A raw syscall the runtime depends on failed (epoll, eventfd, ...).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stack allocation for a new fiber failed.
    #[error("fiber stack allocation of {size} bytes failed: {source}")]
    StackAlloc { size: usize, source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::StackAlloc {
            size: 4096,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(e.to_string().contains("4096"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::from_raw_os_error(libc::EBADF);
        let e: RuntimeError = io_err.into();
        assert!(matches!(e, RuntimeError::Io(_)));
    }
}
