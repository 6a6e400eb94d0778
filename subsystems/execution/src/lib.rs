//! # Rewind Execution
//!
//! Recorded threads, recorded locks and thread snapshots.
//!
//! ## Architecture
//!
//! ```text
//!   Threads ──────────────┬──────────── Locks
//!   │ slots 1..=max        │             │ native address ─▶ RecordedLock
//!   │ Event/<id> streams   │             │ Lock/<id> acquires stream
//!   │ idle / resume        │             │ replay turn order
//!   ▼                      ▼
//!   ThreadSnapshots     call event helpers
//!   {prefix}_{snapshot} stack files
//! ```
//!
//! Thread and lock bookkeeping rolls back through
//! [`Rewindable`](rewind_hal::Rewindable); stacks roll back through
//! [`Threads::save_all_threads`] and [`Threads::restore_all_threads`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod call;
pub mod error;
pub mod event;
pub mod lock;
pub mod snapshot;
pub mod thread;

pub use error::{ExecError, ExecResult};
pub use event::{record_or_replay_event, replay_any_event, ThreadEvent};
pub use lock::{LockId, Locks, RecordedLock, ATOMIC_LOCK_ID, UNRECORDED_LOCK_ID};
pub use snapshot::ThreadSnapshots;
pub use thread::{
    StartRoutine, Thread, ThreadConfig, ThreadId, Threads, UnrecordedWaitCallback,
    MAIN_THREAD_ID,
};
