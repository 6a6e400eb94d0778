//! # Rewind Recording Files
//!
//! Append-only, chunk-compressed logs. A recording holds every recorded
//! thread's event and assertion streams, lock acquisition orders and the
//! weak pointer table; snapshot side files reuse the same format for page
//! contents and thread stacks.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!   │ Stream       │  │ Stream       │  │ Stream       │   1 MiB buffers
//!   │ (Event, 2)   │  │ (Lock, 5)    │  │ (Main, 0)    │
//!   └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!          │ LZ4 chunk       │                 │
//!          ▼                 ▼                 ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │ File: header │ chunks │ index block │ chunks ...│
//!   └─────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod file;
pub mod format;
mod storage;
pub mod stream;

pub use error::{FsError, FsResult};
pub use file::{File, FileMode};
pub use stream::{Stream, StreamHandle, StreamKey, StreamName};
