//! Registry of things named in diagnostics.
//!
//! Pointers differ between runs, so diagnostics refer to objects by the
//! index they were registered under. Registration is ordered through the
//! atomic access lock, which makes the indexes identical during replay.

use std::collections::BTreeMap;

use rewind_execution::{Locks, Threads};
use rewind_hal::{Rewindable, SnapshotId, SpinLock};

use crate::error::{EngineError, EngineResult};
use crate::value_index::ValueIndex;

/// Stable indexes of registered things.
#[derive(Debug)]
pub struct Things {
    threads: &'static Threads,
    locks: &'static Locks,
    index: SpinLock<ValueIndex>,
    saved: SpinLock<BTreeMap<SnapshotId, ValueIndex>>,
}

impl Things {
    /// Empty registry.
    pub fn new(threads: &'static Threads, locks: &'static Locks) -> Self {
        Self {
            threads,
            locks,
            index: SpinLock::new(ValueIndex::new()),
            saved: SpinLock::new(BTreeMap::new()),
        }
    }

    fn registering(&self) -> bool {
        self.threads.current().is_some_and(|thread| !thread.pass_through())
    }

    /// Give `thing` the next index. A thing registered again gets a new one.
    pub fn register(&self, thing: usize) -> EngineResult<()> {
        if !self.registering() {
            return Ok(());
        }
        self.locks.begin_ordered_atomic_access()?;
        self.index.lock().insert(thing);
        self.locks.end_ordered_atomic_access()?;
        Ok(())
    }

    /// Forget `thing`.
    pub fn unregister(&self, thing: usize) -> EngineResult<()> {
        if !self.registering() {
            return Ok(());
        }
        self.locks.begin_ordered_atomic_access()?;
        self.index.lock().remove(thing);
        self.locks.end_ordered_atomic_access()?;
        Ok(())
    }

    /// Index of `thing`, 0 when it is not registered.
    pub fn index_of(&self, thing: usize) -> usize {
        self.index.lock().get_index(thing).unwrap_or(0)
    }
}

impl Rewindable for Things {
    type Error = EngineError;

    fn save_state(&self, snapshot: SnapshotId) {
        let index = self.index.lock().clone();
        self.saved.lock().insert(snapshot, index);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let mut saved = self.saved.lock();
        saved.retain(|id, _| *id <= snapshot);
        if let Some(index) = saved.get(&snapshot) {
            *self.index.lock() = index.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn indexes_are_stable_and_zero_means_none() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "things");
        let things = Things::new(fx.threads, fx.locks);
        things.register(0xdead0).unwrap();
        things.register(0xbeef0).unwrap();
        assert_eq!(things.index_of(0xdead0), 1);
        assert_eq!(things.index_of(0xbeef0), 2);
        assert_eq!(things.index_of(0x1234), 0);

        things.register(0xdead0).unwrap();
        assert_eq!(things.index_of(0xdead0), 3);
        things.unregister(0xbeef0).unwrap();
        assert_eq!(things.index_of(0xbeef0), 0);
    }

    #[test]
    fn pass_through_registrations_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "hidden");
        let things = Things::new(fx.threads, fx.locks);
        fx.threads.main_thread().begin_pass_through();
        things.register(0x40).unwrap();
        fx.threads.main_thread().end_pass_through();
        assert_eq!(things.index_of(0x40), 0);
    }

    #[test]
    fn registry_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "rollback");
        let things = Things::new(fx.threads, fx.locks);
        things.register(0x10).unwrap();
        things.save_state(4);
        things.register(0x20).unwrap();
        things.unregister(0x10).unwrap();
        things.restore_state(4).unwrap();
        assert_eq!(things.index_of(0x10), 1);
        assert_eq!(things.index_of(0x20), 0);
    }
}
