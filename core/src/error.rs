//! Engine errors and how each one is handled.

use rewind_execution::ExecError;
use rewind_hal::{HalError, SnapshotId};
use rewind_memory::MemoryError;
use rewindfs::FsError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A platform primitive failed
    #[error(transparent)]
    Hal(#[from] HalError),

    /// The recording could not be written or read, or an input mismatched
    #[error(transparent)]
    File(#[from] FsError),

    /// Tracked memory or a memory snapshot failed
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A thread, lock or thread snapshot operation failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    // ========================================================================
    // Replay consistency
    // ========================================================================
    /// A text assertion differs from the recorded one
    #[error("Assertion Mismatch: Thread {thread}\nRecorded: {recorded} [{recorded_position}]\nReplayed: {replayed} [{replayed_position}]")]
    AssertionMismatch {
        /// Thread issuing the assertion
        thread: usize,
        /// Text in the recording
        recorded: String,
        /// Event stream position in the recording
        recorded_position: u64,
        /// Text this execution produced
        replayed: String,
        /// Event stream position now
        replayed_position: u64,
    },

    /// A byte assertion differs from the recorded bytes
    #[error("Byte Comparison Check Failed: Position {recorded_position} {replayed_position} Length {recorded_len} {replayed_len}")]
    ByteMismatch {
        /// Event stream position in the recording
        recorded_position: u64,
        /// Event stream position now
        replayed_position: u64,
        /// Recorded byte count
        recorded_len: usize,
        /// Byte count this execution produced
        replayed_len: usize,
    },

    /// Replay found something other than a trigger in the trigger sequence
    #[error("ExecuteTrigger Mismatch")]
    TriggerMismatch,

    /// A weak pointer access succeeded where the recording failed, or the
    /// reverse
    #[error("Inconsistent weak pointer success values during replay")]
    WeakPointerMismatch,

    // ========================================================================
    // Recording state
    // ========================================================================
    /// The recording was invalidated and cannot be saved
    #[error("Recording is unusable: {0}")]
    Unusable(String),

    /// Something invalidated the recording while it was being replayed
    #[error("Recording invalidated while replaying: {0}")]
    InvalidatedWhileReplaying(String),

    /// Execution diverged and the caller disallowed rewinding out of it
    #[error("unhandled divergence from the recording")]
    UnhandledDivergence,

    // ========================================================================
    // Engine
    // ========================================================================
    /// No engine is running in this process
    #[error("record/replay engine is not initialized")]
    NotInitialized,

    /// Bootstrap failed; the first failure is latched
    #[error("record/replay bootstrap failed: {0}")]
    Bootstrap(String),

    /// A setting is malformed
    #[error("configuration: {0}")]
    Config(String),

    /// The rewind target is ahead of execution
    #[error("cannot rewind to snapshot {target}: last snapshot is {last:?}")]
    BadSnapshot {
        /// Requested snapshot
        target: SnapshotId,
        /// Most recent snapshot
        last: Option<SnapshotId>,
    },

    /// Nothing was recorded to rewind to
    #[error("no recorded snapshot to rewind to")]
    NoRecordedSnapshot,

    /// Rewinding would drop callbacks queued for the main thread
    #[error("{0} main thread callbacks are still pending")]
    PendingCallbacks(usize),

    /// A registry has no entry for a pointer or id
    #[error("{what} {key:#x} is not registered")]
    NotRegistered {
        /// Registry kind
        what: &'static str,
        /// Pointer or id looked up
        key: usize,
    },

    /// An object registered by one thread was used by another
    #[error("{what} {key:#x} belongs to thread {owner}, used by thread {thread}")]
    WrongThread {
        /// Registry kind
        what: &'static str,
        /// Pointer looked up
        key: usize,
        /// Registering thread
        owner: usize,
        /// Calling thread
        thread: usize,
    },
}

/// What the engine does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Rewind to the last recorded snapshot and keep going
    Rewind,
    /// Report and park
    Fatal,
}

impl EngineError {
    /// Classify the error. Running past the recorded progress and events
    /// issued after diverging are recovered by rewinding; everything else
    /// is fatal.
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::File(err) if err.is_end_of_recording() => Disposition::Rewind,
            EngineError::Exec(err) if err.is_end_of_recording() => Disposition::Rewind,
            EngineError::Exec(ExecError::Diverged(_)) => Disposition::Rewind,
            _ => Disposition::Fatal,
        }
    }

    /// Whether the error means replay passed the end of the recording.
    pub fn is_end_of_recording(&self) -> bool {
        match self {
            EngineError::File(err) => err.is_end_of_recording(),
            EngineError::Exec(err) => err.is_end_of_recording(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewindfs::StreamName;

    #[test]
    fn end_of_thread_streams_rewinds() {
        let end = EngineError::File(FsError::EndOfStream {
            name: StreamName::Assert,
            index: 3,
        });
        assert_eq!(end.disposition(), Disposition::Rewind);
        assert!(end.is_end_of_recording());

        let lock_end = EngineError::Exec(ExecError::EndOfLockStream { lock: 4, thread: 1 });
        assert_eq!(lock_end.disposition(), Disposition::Rewind);
    }

    #[test]
    fn other_streams_and_mismatches_are_fatal() {
        let weak = EngineError::File(FsError::EndOfStream {
            name: StreamName::WeakPointer,
            index: 0,
        });
        assert_eq!(weak.disposition(), Disposition::Fatal);
        let mismatch = EngineError::File(FsError::InputMismatch {
            recorded: 1,
            replayed: 2,
        });
        assert_eq!(mismatch.disposition(), Disposition::Fatal);
        assert_eq!(EngineError::TriggerMismatch.disposition(), Disposition::Fatal);
    }

    #[test]
    fn divergence_rewinds() {
        let diverged = EngineError::Exec(ExecError::Diverged(1));
        assert_eq!(diverged.disposition(), Disposition::Rewind);
        assert!(!diverged.is_end_of_recording());
    }

    #[test]
    fn assertion_report_format() {
        let err = EngineError::AssertionMismatch {
            thread: 2,
            recorded: "Value".into(),
            recorded_position: 10,
            replayed: "Bytes 4".into(),
            replayed_position: 12,
        };
        assert_eq!(
            err.to_string(),
            "Assertion Mismatch: Thread 2\nRecorded: Value [10]\nReplayed: Bytes 4 [12]"
        );
        assert_eq!(
            EngineError::Unusable("lost input".into()).to_string(),
            "Recording is unusable: lost input"
        );
    }
}
