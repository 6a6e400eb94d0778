//! Error types for the platform layer.

use std::io;

/// Result type alias for platform operations.
pub type HalResult<T> = Result<T, HalError>;

/// Failures reported by the operating system primitives wrapped in this crate.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    // ========================================================================
    // Memory
    // ========================================================================
    /// `mmap` refused to map memory
    #[error("cannot map {size} bytes: {source}")]
    Map {
        /// Requested size in bytes
        size: usize,
        /// Underlying OS error
        source: io::Error,
    },

    /// `munmap` failed
    #[error("cannot unmap {size} bytes at {base:#x}: {source}")]
    Unmap {
        /// Region base
        base: usize,
        /// Region size
        size: usize,
        /// Underlying OS error
        source: io::Error,
    },

    /// `mprotect` failed
    #[error("cannot change protection of {size} bytes at {base:#x}: {source}")]
    Protect {
        /// Region base
        base: usize,
        /// Region size
        size: usize,
        /// Underlying OS error
        source: io::Error,
    },

    // ========================================================================
    // Process introspection
    // ========================================================================
    /// A line of `/proc/self/maps` could not be parsed
    #[error("malformed memory map line: {0:?}")]
    MalformedMap(String),

    /// Reading process state failed
    #[error("process introspection failed: {0}")]
    Io(#[from] io::Error),

    /// The calling thread's stack bounds could not be queried
    #[error("cannot query thread stack: error {0}")]
    StackQuery(i32),

    // ========================================================================
    // Signals
    // ========================================================================
    /// Installing a signal handler failed
    #[error("cannot install handler for signal {signal}: {source}")]
    Signal {
        /// Signal number
        signal: i32,
        /// Underlying OS error
        source: io::Error,
    },
}

impl HalError {
    /// Capture `errno` for a failed map of `size` bytes.
    pub(crate) fn map(size: usize) -> Self {
        Self::Map {
            size,
            source: io::Error::last_os_error(),
        }
    }
}
