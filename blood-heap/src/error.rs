//! Error types for the heap-region manager.
//!
//! Allocation fast paths report failure as `None` so that the caller can
//! collect and retry. Everything that creates, reshapes or registers a region
//! returns [`MemResult`] so that the cause can be logged before the caller
//! decides what to do with it.

use thiserror::Error;

use crate::Address;

/// Result alias used throughout the crate.
pub type MemResult<T> = Result<T, MemError>;

/// Errors produced by the heap-region manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// A descriptor table, bitmap or index node could not be allocated.
    #[error("out of memory: {what}")]
    OutOfMemory {
        /// What was being allocated.
        what: &'static str,
    },

    /// The OS refused to map memory.
    #[error("unable to map {size} bytes: {errno}")]
    MapFailed {
        /// Requested size in bytes.
        size: usize,
        /// Error reported by the OS.
        errno: nix::errno::Errno,
    },

    /// The OS refused to unmap or re-protect memory.
    #[error("unable to change mapping at {base:#x} ({size} bytes): {errno}")]
    ProtectFailed {
        /// Base of the range.
        base: Address,
        /// Size of the range in bytes.
        size: usize,
        /// Error reported by the OS.
        errno: nix::errno::Errno,
    },

    /// A region was not found in the list it was expected to be in.
    #[error("region at {bottom:#x} is not registered as {expected}")]
    UnknownSpace {
        /// Bottom address of the region.
        bottom: Address,
        /// The list that was searched.
        expected: &'static str,
    },

    /// An internal consistency check failed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl MemError {
    /// Whether this error belongs to the out-of-memory class.
    ///
    /// These are always recoverable by the caller, normally by collecting
    /// and retrying.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, MemError::OutOfMemory { .. } | MemError::MapFailed { .. })
    }
}

/// Report an invariant violation: fatal in debug builds, an error otherwise.
pub(crate) fn invariant(message: impl Into<String>) -> MemError {
    let message = message.into();
    debug_assert!(false, "{}", message);
    tracing::error!(%message, "heap invariant violated");
    MemError::InvariantViolation(message)
}
