//! Crate-wide error taxonomy.
//!
//! Each subsystem has its own `thiserror` enum; [`ErrorKind`] is the coarse
//! classification callers use to decide whether to retry, abort, or report.

use serde::Serialize;

/// Coarse category shared by every error type in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Allocation failed or an output buffer was too small.
    Allocation,
    /// Open/read/write/rename failure on a swap, spill, or state file.
    Io,
    /// Magic, checksum, stream, or dimension mismatch.
    CorruptData,
    /// Empty, zero-sized, or out-of-range input.
    InvalidArgument,
    /// Requested format or bit width is not implemented.
    Unsupported,
}

impl ErrorKind {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Io | ErrorKind::Allocation)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Allocation => write!(f, "allocation failure"),
            ErrorKind::Io => write!(f, "I/O failure"),
            ErrorKind::CorruptData => write!(f, "corrupt data"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
        }
    }
}
