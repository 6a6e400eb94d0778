//! # Rewind Platform Layer
//!
//! Operating system and CPU primitives used by the record/replay engine.
//! Nothing in this crate records or replays anything; it only wraps what the
//! upper layers need from the platform:
//!
//! - [`sync`]: spin locks usable inside the fault handler
//! - [`arch`]: restartable context capture
//! - [`memory`]: page mapping and protection
//! - [`maps`]: the process memory map
//! - [`fault`]: write-fault dispatch
//! - [`pipe`]: wakeup channels
//! - [`stack`]: thread stack bounds
//! - [`fatal`]: unrecoverable error reporting
//! - [`rewind`]: the [`Rewindable`](rewind::Rewindable) capability

#![deny(unsafe_op_in_unsafe_fn)]

pub mod arch;
pub mod error;
pub mod fatal;
pub mod fault;
pub mod maps;
pub mod memory;
pub mod pipe;
pub mod rewind;
pub mod stack;
pub mod sync;

pub use error::{HalError, HalResult};
pub use rewind::{Rewindable, SnapshotId};
pub use sync::{RwSpinLock, SpinLock};
