//! # Rewind Tracked Memory
//!
//! Memory whose contents roll back when execution rewinds, and the allocator
//! that serves it.
//!
//! ## Architecture
//!
//! ```text
//!   write fault ──▶ MemorySnapshots::handle_fault ──▶ DirtyPageTable
//!                                                       │ take_diff
//!                                                       ▼
//!                 ┌───────────────┬───────────────┬───────────────┐
//!                 │ worker 0      │ worker 1      │ worker n-1    │
//!                 │ DirtyPageSets │ DirtyPageSets │ DirtyPageSets │
//!                 └───────┬───────┴───────┬───────┴───────┬───────┘
//!                         │ under pressure│               │
//!                         ▼               ▼               ▼
//!                   {prefix}_{snapshot * n + worker} side files
//! ```
//!
//! Tracked regions are write-protected from the first snapshot on. Pages
//! written since the last recorded snapshot form the active dirty set; older
//! diffs belong to the snapshot workers, in memory until the page copy pool
//! crosses its high mark and on disk afterwards.
//!
//! Memory released after the first snapshot is kept in free region sets
//! instead of being unmapped. The tracked set is itself rolled back through
//! [`Rewindable`](rewind_hal::Rewindable).

#![deny(unsafe_op_in_unsafe_fn)]

pub mod dirty;
pub mod error;
pub mod free;
pub mod kind;
pub mod region;
pub mod snapshot;
pub mod worker;

pub use error::{MemoryError, MemoryResult};
pub use kind::MemoryKind;
pub use region::TrackedRegion;
pub use snapshot::{MemoryConfig, MemorySnapshots, MemoryStats};
