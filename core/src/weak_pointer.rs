//! Weak pointers.
//!
//! Garbage collection timing is not recorded, so whether a weak pointer is
//! still alive when accessed can differ during replay. Recording counts the
//! successful accesses of each weak pointer and writes the totals to the
//! WeakPointer stream. Replay starts from those totals and counts down: the
//! registered callback is told whether the target must be kept alive
//! (`true`) while recorded hits remain, so the replayed accesses succeed
//! exactly as often as the recorded ones.
//!
//! Each pointer is identified by its index in a [`ValueIndex`] starting at
//! 0. A failed access reinserts the pointer under a fresh index, since the
//! application is expected to re-create what the pointer referred to.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use rewind_execution::{ExecError, Locks, ThreadId, Threads};
use rewind_hal::{Rewindable, SnapshotId, SpinLock};
use rewindfs::{File, StreamName};

use crate::assert::Assertions;
use crate::error::{EngineError, EngineResult};
use crate::value_index::ValueIndex;

/// Told whether the target of a weak pointer must stay alive.
pub type WeakPointerCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
struct WeakPointerInfo {
    thread: ThreadId,
    callback: WeakPointerCallback,
}

#[derive(Clone)]
struct WeakPointerTable {
    ids: ValueIndex,
    info: HashMap<usize, WeakPointerInfo>,
    /// Hits so far while recording, hits left while replaying.
    hits: Vec<u64>,
}

impl Default for WeakPointerTable {
    fn default() -> Self {
        Self {
            ids: ValueIndex::starting_at(0),
            info: HashMap::new(),
            hits: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct SavedTable {
    table: WeakPointerTable,
    while_recording: bool,
}

/// Registered weak pointers.
pub struct WeakPointers {
    threads: &'static Threads,
    locks: &'static Locks,
    asserts: &'static Assertions,
    table: SpinLock<WeakPointerTable>,
    /// Recorded totals, once written or read back.
    totals: SpinLock<Option<Vec<u64>>>,
    /// Pointers whose callbacks must run again on their own thread.
    pending: SpinLock<Vec<(ThreadId, usize)>>,
    saved: SpinLock<BTreeMap<SnapshotId, SavedTable>>,
}

impl core::fmt::Debug for WeakPointers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("WeakPointers")
            .field("registered", &table.info.len())
            .field("ids", &table.hits.len())
            .finish()
    }
}

impl WeakPointers {
    /// No weak pointers registered.
    pub fn new(threads: &'static Threads, locks: &'static Locks, asserts: &'static Assertions) -> Self {
        Self {
            threads,
            locks,
            asserts,
            table: SpinLock::new(WeakPointerTable::default()),
            totals: SpinLock::new(None),
            pending: SpinLock::new(Vec::new()),
            saved: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Calling thread, or `None` when weak pointers are not tracked for it.
    fn tracking_thread(&self, operation: &'static str) -> EngineResult<Option<ThreadId>> {
        let thread = self
            .threads
            .current()
            .ok_or(ExecError::NotRecorded(operation))?;
        if thread.pass_through() {
            return Err(ExecError::NotRecorded(operation).into());
        }
        if self.threads.has_diverged() {
            return Ok(None);
        }
        self.run_pending_fixups(thread.id());
        Ok(Some(thread.id()))
    }

    /// Track `ptr`, owned by the calling thread.
    pub fn register(&self, ptr: usize, callback: impl Fn(bool) + Send + Sync + 'static) -> EngineResult<()> {
        let Some(thread) = self.tracking_thread("register_weak_pointer")? else {
            return Ok(());
        };
        let recording = self.threads.file().is_recording();

        self.locks.begin_ordered_atomic_access()?;
        let id = {
            let mut table = self.table.lock();
            let id = table.ids.insert(ptr);
            table.info.insert(
                ptr,
                WeakPointerInfo {
                    thread,
                    callback: Arc::new(callback),
                },
            );
            if recording {
                debug_assert_eq!(id, table.hits.len());
                table.hits.push(0);
            }
            id
        };
        self.locks.end_ordered_atomic_access()?;

        self.asserts.assert(&format!("RegisterWeakPointer {}", id))
    }

    /// Stop tracking `ptr`.
    pub fn unregister(&self, ptr: usize) -> EngineResult<()> {
        let Some(thread) = self.tracking_thread("unregister_weak_pointer")? else {
            return Ok(());
        };
        let id = self.owned_id(ptr, thread)?;
        self.asserts.assert(&format!("UnregisterWeakPointer {}", id))?;

        let mut table = self.table.lock();
        table.ids.remove(ptr);
        table.info.remove(&ptr);
        Ok(())
    }

    fn owned_id(&self, ptr: usize, thread: ThreadId) -> EngineResult<usize> {
        let table = self.table.lock();
        let (id, info) = table
            .ids
            .get_index(ptr)
            .zip(table.info.get(&ptr))
            .ok_or(EngineError::NotRegistered {
                what: "weak pointer",
                key: ptr,
            })?;
        if info.thread != thread {
            return Err(EngineError::WrongThread {
                what: "weak pointer",
                key: ptr,
                owner: info.thread,
                thread,
            });
        }
        Ok(id)
    }

    /// `ptr` was dereferenced, reaching its target when `success` is set.
    pub fn access(&self, ptr: usize, success: bool) -> EngineResult<()> {
        let Some(thread) = self.tracking_thread("weak_pointer_access")? else {
            return Ok(());
        };
        let recording = self.threads.file().is_recording();
        let id = self.owned_id(ptr, thread)?;

        if !recording {
            let remaining = self.table.lock().hits.get(id).copied().unwrap_or(0);
            if success != (remaining > 0) {
                return Err(EngineError::WeakPointerMismatch);
            }
        }
        self.asserts.assert(&format!("WeakPointerAccess {}", id))?;

        if success {
            let mut table = self.table.lock();
            if let Some(hits) = table.hits.get_mut(id) {
                *hits = if recording { *hits + 1 } else { hits.saturating_sub(1) };
            }
        } else {
            self.locks.begin_ordered_atomic_access()?;
            let new_id = {
                let mut table = self.table.lock();
                let new_id = table.ids.insert(ptr);
                if recording {
                    debug_assert_eq!(new_id, table.hits.len());
                    table.hits.push(0);
                }
                new_id
            };
            self.locks.end_ordered_atomic_access()?;
            self.asserts
                .assert(&format!("WeakPointerAccess Miss {}", new_id))?;
        }

        if !recording {
            self.notify(ptr, id);
        }
        Ok(())
    }

    /// Tell the callback of `ptr` whether hits remain under `id`.
    fn notify(&self, ptr: usize, id: usize) {
        let found = {
            let table = self.table.lock();
            table.info.get(&ptr).map(|info| {
                let remaining = table.hits.get(id).copied().unwrap_or(0);
                (Arc::clone(&info.callback), remaining > 0)
            })
        };
        if let Some((callback, keep_alive)) = found {
            callback(keep_alive);
        }
    }

    /// Hits recorded so far, or left to replay, for `ptr`.
    pub fn hits(&self, ptr: usize) -> Option<u64> {
        let table = self.table.lock();
        let id = table.ids.get_index(ptr)?;
        table.hits.get(id).copied()
    }

    // ========================================================================
    // WeakPointer stream
    // ========================================================================

    /// Append the recorded hit counts to `file`. The counts become the
    /// totals later rewinds replay against.
    pub fn write_table(&self, file: &File) -> EngineResult<()> {
        let hits = self.table.lock().hits.clone();
        {
            let stream = file.open_stream(StreamName::WeakPointer, 0);
            let mut stream = stream.lock();
            stream.write_scalar(hits.len() as u64)?;
            for count in &hits {
                stream.write_scalar(*count)?;
            }
        }
        log::debug!("wrote {} weak pointer hit counts", hits.len());
        *self.totals.lock() = Some(hits);
        Ok(())
    }

    /// Start replaying from the hit counts stored in `file`.
    pub fn read_table(&self, file: &File) -> EngineResult<()> {
        let hits = {
            let stream = file.open_stream(StreamName::WeakPointer, 0);
            let mut stream = stream.lock();
            let count = stream.read_scalar()? as usize;
            (0..count)
                .map(|_| stream.read_scalar())
                .collect::<Result<Vec<_>, _>>()?
        };
        self.table.lock().hits = hits.clone();
        *self.totals.lock() = Some(hits);
        Ok(())
    }

    /// Run the callbacks queued for `thread` by a rewind into a snapshot
    /// taken while recording.
    pub fn run_pending_fixups(&self, thread: ThreadId) {
        let mine: Vec<usize> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let (mine, rest) = pending.drain(..).partition(|(owner, _)| *owner == thread);
            *pending = rest;
            mine.into_iter().map(|(_, ptr)| ptr).collect()
        };
        for ptr in mine {
            let id = self.table.lock().ids.get_index(ptr);
            if let Some(id) = id {
                self.notify(ptr, id);
            }
        }
    }

    /// Turn hits counted up to a snapshot into hits left to replay.
    fn convert_to_remaining(&self, table: &mut WeakPointerTable) -> EngineResult<()> {
        let totals = self.totals.lock();
        let totals = totals
            .as_ref()
            .ok_or_else(|| EngineError::Unusable("weak pointer totals were never written".into()))?;
        table.hits = totals
            .iter()
            .enumerate()
            .map(|(id, total)| total.saturating_sub(table.hits.get(id).copied().unwrap_or(0)))
            .collect();

        let mut pending = self.pending.lock();
        pending.clear();
        pending.extend(table.info.iter().map(|(ptr, info)| (info.thread, *ptr)));
        Ok(())
    }
}

impl Rewindable for WeakPointers {
    type Error = EngineError;

    fn save_state(&self, snapshot: SnapshotId) {
        let saved = SavedTable {
            table: self.table.lock().clone(),
            while_recording: self.threads.file().is_recording(),
        };
        self.saved.lock().insert(snapshot, saved);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let restored = {
            let mut saved = self.saved.lock();
            saved.retain(|id, _| *id <= snapshot);
            saved.get(&snapshot).cloned()
        };
        let Some(SavedTable {
            mut table,
            while_recording,
        }) = restored
        else {
            return Ok(());
        };
        if while_recording && !self.threads.file().is_recording() {
            self.convert_to_remaining(&mut table)?;
        }
        *self.table.lock() = table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{leak, Fixture};
    use rewind_execution::MAIN_THREAD_ID;

    fn weak_pointers(fx: &Fixture) -> &'static WeakPointers {
        leak(WeakPointers::new(fx.threads, fx.locks, fx.asserts))
    }

    #[test]
    fn replay_keeps_targets_alive_while_hits_remain() {
        let dir = tempfile::tempdir().unwrap();
        static KEEP: SpinLock<Vec<bool>> = SpinLock::new(Vec::new());
        {
            let fx = Fixture::new(&dir, "weak");
            let weak = weak_pointers(&fx);
            weak.register(0x100, |_| {}).unwrap();
            weak.access(0x100, true).unwrap();
            weak.access(0x100, true).unwrap();
            weak.access(0x100, false).unwrap();
            assert_eq!(weak.hits(0x100), Some(0));
            weak.write_table(fx.threads.file()).unwrap();
            fx.finish();
        }

        let fx = Fixture::new(&dir, "weak");
        let weak = weak_pointers(&fx);
        weak.read_table(fx.threads.file()).unwrap();
        weak.register(0x200, |keep| KEEP.lock().push(keep)).unwrap();
        assert_eq!(weak.hits(0x200), Some(2));
        weak.access(0x200, true).unwrap();
        weak.access(0x200, true).unwrap();
        weak.access(0x200, false).unwrap();
        assert_eq!(*KEEP.lock(), vec![true, false, false]);
    }

    #[test]
    fn replayed_success_must_match() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fx = Fixture::new(&dir, "mismatch");
            let weak = weak_pointers(&fx);
            weak.register(0x100, |_| {}).unwrap();
            weak.access(0x100, false).unwrap();
            weak.write_table(fx.threads.file()).unwrap();
            fx.finish();
        }
        let fx = Fixture::new(&dir, "mismatch");
        let weak = weak_pointers(&fx);
        weak.read_table(fx.threads.file()).unwrap();
        weak.register(0x100, |_| {}).unwrap();
        assert!(matches!(
            weak.access(0x100, true),
            Err(EngineError::WeakPointerMismatch)
        ));
    }

    #[test]
    fn rewinding_out_of_a_recording_counts_down_the_rest() {
        static KEEP: SpinLock<Vec<bool>> = SpinLock::new(Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "fixup");
        let weak = weak_pointers(&fx);
        weak.register(0x100, |keep| KEEP.lock().push(keep)).unwrap();
        weak.access(0x100, true).unwrap();
        weak.save_state(0);
        weak.access(0x100, true).unwrap();
        weak.access(0x100, true).unwrap();
        weak.write_table(fx.threads.file()).unwrap();

        fx.threads.file().switch_to_replay().unwrap();
        weak.restore_state(0).unwrap();
        assert_eq!(weak.hits(0x100), Some(2));
        assert!(KEEP.lock().is_empty());
        weak.run_pending_fixups(MAIN_THREAD_ID);
        assert_eq!(*KEEP.lock(), vec![true]);
    }

    #[test]
    fn other_threads_cannot_touch_a_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "owner");
        let weak = weak_pointers(&fx);
        weak.register(0x100, |_| {}).unwrap();
        {
            let mut table = weak.table.lock();
            table.info.get_mut(&0x100).unwrap().thread = 2;
        }
        assert!(matches!(
            weak.access(0x100, true),
            Err(EngineError::WrongThread { owner: 2, .. })
        ));
        assert!(weak.unregister(0x300).is_err());
    }
}
