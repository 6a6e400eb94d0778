//! Snapshot identities and the capability implemented by bookkeeping that
//! must roll back when execution rewinds.

/// Monotonic snapshot number. Snapshot 0 is the first one taken.
pub type SnapshotId = usize;

/// State that is checkpointed at every recorded snapshot and rolled back to
/// it by a rewind.
///
/// Tracked memory rolls back through page restoration. Engine bookkeeping
/// lives outside tracked memory, so each owner captures the part of its
/// state that must follow the rewind here.
pub trait Rewindable {
    /// Error raised when rolling back fails.
    type Error;

    /// Capture state for recorded snapshot `snapshot`. All recorded threads
    /// are idle.
    fn save_state(&self, snapshot: SnapshotId);

    /// Roll back to the state captured for `snapshot`, discarding states of
    /// later snapshots.
    fn restore_state(&self, snapshot: SnapshotId) -> Result<(), Self::Error>;
}
