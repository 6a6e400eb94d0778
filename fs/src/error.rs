//! Error types for recording files.

use std::io;

use crate::stream::StreamName;

/// Result type alias for recording file operations.
pub type FsResult<T> = Result<T, FsError>;

/// Failures while writing or reading a recording.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    // ========================================================================
    // Physical errors
    // ========================================================================
    /// I/O on the backing file failed
    #[error("recording I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The file does not start with a recording header
    #[error("not a recording file (magic {magic:#x}, version {version})")]
    BadHeader {
        /// Magic number found
        magic: u32,
        /// Version found
        version: u32,
    },

    /// An index block or chunk prefix is inconsistent
    #[error("corrupt recording: {0}")]
    Corrupt(String),

    /// A chunk did not decompress to its indexed length
    #[error("chunk decompression failed: expected {expected} bytes, {detail}")]
    Decompress {
        /// Indexed decompressed size
        expected: usize,
        /// What went wrong
        detail: String,
    },

    // ========================================================================
    // Logical errors
    // ========================================================================
    /// A reading stream has no more data
    #[error("end of {name:?} stream {index}")]
    EndOfStream {
        /// Stream kind
        name: StreamName,
        /// Per-name index
        index: usize,
    },

    /// A replayed value differs from the recorded one
    #[error("Input Mismatch: Recorded: {recorded} Replayed {replayed}")]
    InputMismatch {
        /// Value in the recording
        recorded: u64,
        /// Value computed by this execution
        replayed: u64,
    },

    /// A write was attempted on a reading file or the reverse
    #[error("stream used in the wrong mode (file is {actual})")]
    WrongMode {
        /// Mode the file is in
        actual: &'static str,
    },

    /// A seek target lies beyond the recorded data
    #[error("cannot seek {name:?} stream {index} to {position}, only {available} bytes recorded")]
    SeekPastEnd {
        /// Stream kind
        name: StreamName,
        /// Per-name index
        index: usize,
        /// Requested position
        position: u64,
        /// Bytes available
        available: u64,
    },
}

impl FsError {
    /// Running off an Event or Assert stream means replay has passed the
    /// recorded progress. That is recoverable by rewinding; every other
    /// error is fatal.
    pub fn is_end_of_recording(&self) -> bool {
        matches!(
            self,
            FsError::EndOfStream {
                name: StreamName::Event | StreamName::Assert,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_thread_streams_end_the_recording() {
        let event = FsError::EndOfStream {
            name: StreamName::Event,
            index: 2,
        };
        let lock = FsError::EndOfStream {
            name: StreamName::Lock,
            index: 2,
        };
        assert!(event.is_end_of_recording());
        assert!(!lock.is_end_of_recording());
    }

    #[test]
    fn mismatch_message_reports_both_values() {
        let err = FsError::InputMismatch {
            recorded: 4,
            replayed: 5,
        };
        assert_eq!(err.to_string(), "Input Mismatch: Recorded: 4 Replayed 5");
    }
}
