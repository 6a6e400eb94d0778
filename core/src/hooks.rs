//! Hooks the engine calls out to.
//!
//! The controller side of the process (checkpoint requests, breakpoints,
//! the debugger connection) lives outside the engine and learns about
//! snapshots, saved recordings and failures through these callbacks.

use std::path::Path;

use rewind_hal::SnapshotId;

/// Receiver of engine notifications. Every method has an empty default.
pub trait EngineHooks: Send + Sync {
    /// A snapshot is about to be taken.
    fn before_snapshot(&self) {}

    /// Snapshot `snapshot` was reached. `interim` is set when execution only
    /// passes through it on the way to a later rewind target. The hook runs
    /// on the main thread with recorded events disallowed and may start
    /// another rewind.
    fn after_snapshot(&self, snapshot: SnapshotId, is_final: bool, interim: bool) {
        let _ = (snapshot, is_final, interim);
    }

    /// A complete recording was written to `path`.
    fn on_save_recording(&self, path: &Path) {
        let _ = path;
    }

    /// Replay reached the end of the recording and is about to rewind.
    fn on_end_of_recording(&self) {}

    /// A fatal error was reported. The failing thread parks afterwards.
    fn on_fatal(&self, message: &str) {
        let _ = message;
    }
}

/// Hooks that ignore every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl EngineHooks for NoHooks {}
