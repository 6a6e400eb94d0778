//! Execution subsystem errors.

use rewind_hal::{HalError, SnapshotId};
use rewindfs::FsError;

use crate::event::ThreadEvent;
use crate::lock::LockId;
use crate::thread::ThreadId;

/// Result type alias for thread and lock operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// Failures of recorded threads, locks and thread snapshots.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A platform primitive failed
    #[error(transparent)]
    Hal(#[from] HalError),

    /// Reading or writing a stream failed, or a replayed value mismatched
    #[error(transparent)]
    File(#[from] FsError),

    // ========================================================================
    // Events
    // ========================================================================
    /// The replayed event differs from the recorded one
    #[error("Event Mismatch: Recorded {} Replayed {}", recorded_event(.recorded), .replayed.name())]
    EventMismatch {
        /// Raw event tag in the recording
        recorded: u64,
        /// Event this execution produced
        replayed: ThreadEvent,
    },

    /// An event was recorded or replayed inside a disallow section
    #[error("thread {0} issued a recorded event while events are disallowed")]
    EventsDisallowed(ThreadId),

    /// A recorded event happened after execution diverged from the recording
    #[error("thread {0} issued a recorded event after diverging from the recording")]
    Diverged(ThreadId),

    /// The operation must be issued by recorded, non pass-through code
    #[error("{0} requires a recorded thread outside pass-through")]
    NotRecorded(&'static str),

    /// The operation is reserved to the main thread
    #[error("{0} may only be called on the main thread")]
    NotMainThread(&'static str),

    // ========================================================================
    // Threads
    // ========================================================================
    /// Every recorded thread slot is taken
    #[error("Too many threads")]
    TooManyThreads,

    /// Every non-recorded thread slot is taken
    #[error("no free non-recorded thread slot")]
    TooManyHelpers,

    /// A thread id read from the recording or passed in is out of range
    #[error("invalid thread id {0}")]
    BadThreadId(u64),

    /// Joining a thread that was not started joinable
    #[error("thread {0} is not joinable")]
    NotJoinable(ThreadId),

    /// Every call event helper is busy
    #[error("no idle call event helper thread")]
    NoCallEventHelper,

    /// A thread could not be spawned
    #[error("cannot spawn thread: {0}")]
    Spawn(std::io::Error),

    // ========================================================================
    // Thread snapshots
    // ========================================================================
    /// The capture point is too far below its stack separator
    #[error("thread {0} captured more than the stack top window")]
    StackWindow(ThreadId),

    /// A stack image does not fit the thread's stack
    #[error("bad stack image for thread {thread}: {problem}")]
    BadStack {
        /// Thread whose stack was saved or loaded
        thread: ThreadId,
        /// What is wrong with it
        problem: &'static str,
    },

    /// No bookkeeping was saved for a rewind target
    #[error("no thread state saved for snapshot {0}")]
    NoSavedState(SnapshotId),

    // ========================================================================
    // Locks
    // ========================================================================
    /// No recorded lock exists at a native address
    #[error("no recorded lock at {0:#x}")]
    UnknownLock(usize),

    /// Leaving a lock the thread does not hold
    #[error("thread {thread} does not hold lock {lock}")]
    NotOwner {
        /// Lock id
        lock: LockId,
        /// Thread that tried to leave it
        thread: ThreadId,
    },

    /// Replay wants an acquisition the recording does not have
    #[error("lock {lock} has no more recorded acquisitions (thread {thread} waiting)")]
    EndOfLockStream {
        /// Lock id
        lock: LockId,
        /// Thread waiting for its turn
        thread: ThreadId,
    },

    /// The replayed acquisition order cannot make progress
    #[error("Lock order mismatch: lock {lock} waits for thread {next_owner}, thread {thread} {reason}")]
    LockOrder {
        /// Lock id
        lock: LockId,
        /// Thread waiting for its turn
        thread: ThreadId,
        /// Owner the recording names next
        next_owner: u64,
        /// Why the wait is hopeless
        reason: &'static str,
    },
}

fn recorded_event(tag: &u64) -> std::borrow::Cow<'static, str> {
    ThreadEvent::describe(*tag)
}

impl ExecError {
    /// Whether the error means replay has passed the recorded progress, so
    /// rewinding to an earlier snapshot recovers from it.
    pub fn is_end_of_recording(&self) -> bool {
        match self {
            ExecError::File(err) => err.is_end_of_recording(),
            ExecError::EndOfLockStream { .. } => true,
            _ => false,
        }
    }
}
