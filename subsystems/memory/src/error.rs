//! Memory subsystem errors.

use rewind_hal::{HalError, SnapshotId};
use rewindfs::FsError;

/// Result type alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Failures of tracked memory management and snapshotting.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A platform primitive failed
    #[error(transparent)]
    Hal(#[from] HalError),

    /// A snapshot side file could not be written or read
    #[error("snapshot file: {0}")]
    File(#[from] FsError),

    /// The first snapshot was already taken
    #[error("first memory snapshot already taken")]
    AlreadyTaken,

    /// An operation needs the first snapshot
    #[error("no memory snapshot has been taken")]
    NotTaken,

    /// A registered region cannot be tracked
    #[error("cannot track {size:#x} bytes at {base:#x}: {reason}")]
    Untrackable {
        /// Region base
        base: usize,
        /// Region size
        size: usize,
        /// Why the region was refused
        reason: &'static str,
    },

    /// Fixed memory handed back by the caller is not usable
    #[error("fixed memory at {base:#x} ({size:#x} bytes) is {problem}")]
    FixedMemory {
        /// Range base
        base: usize,
        /// Range size
        size: usize,
        /// "not tracked" or "currently free"
        problem: &'static str,
    },

    /// An allocation request was malformed
    #[error("bad allocation request: {0}")]
    BadRequest(&'static str),

    /// No allocator state was saved for a rewind target
    #[error("no allocator state saved for snapshot {0}")]
    NoSavedState(SnapshotId),

    /// A snapshot worker failed while writing or restoring pages
    #[error("snapshot worker {worker} failed: {source}")]
    Worker {
        /// Worker index
        worker: usize,
        /// Underlying failure
        source: Box<MemoryError>,
    },

    /// A snapshot worker thread could not be started
    #[error("cannot start snapshot worker: {0}")]
    Spawn(std::io::Error),
}
