//! Callbacks from native code.
//!
//! Native code run in pass-through mode may call back into recorded code.
//! While recording, each such callback is bracketed by
//! [`Callbacks::begin_callback`] and [`Callbacks::end_callback`], which
//! leave pass-through for its duration and write an `ExecuteCallback` event
//! with the callback id. During replay the native code is not run at all:
//! [`Callbacks::pass_through_allow_callbacks`] reads those events back and
//! invokes the registered handler for each id, until `CallbacksFinished`.
//!
//! Data pointers passed to callbacks are recorded through their index in a
//! [`ValueIndex`], so the replayed handler sees the matching object.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use rewind_execution::{record_or_replay_event, replay_any_event, ExecError, Locks, ThreadEvent, Threads};
use rewind_hal::{Rewindable, RwSpinLock, SnapshotId, SpinLock};

use crate::assert::Assertions;
use crate::error::{EngineError, EngineResult};
use crate::value_index::ValueIndex;

/// Code replaying one kind of callback.
pub type CallbackHandler = Arc<dyn Fn() + Send + Sync>;

/// Registered callbacks and callback data.
pub struct Callbacks {
    threads: &'static Threads,
    locks: &'static Locks,
    asserts: &'static Assertions,
    handlers: RwSpinLock<HashMap<usize, CallbackHandler>>,
    data: SpinLock<ValueIndex>,
    saved: SpinLock<BTreeMap<SnapshotId, ValueIndex>>,
}

impl core::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callbacks")
            .field("handlers", &self.handlers.read().len())
            .field("data", &self.data.lock().len())
            .finish()
    }
}

impl Callbacks {
    /// No callbacks registered.
    pub fn new(threads: &'static Threads, locks: &'static Locks, asserts: &'static Assertions) -> Self {
        Self {
            threads,
            locks,
            asserts,
            handlers: RwSpinLock::new(HashMap::new()),
            data: SpinLock::new(ValueIndex::new()),
            saved: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Use `handler` to replay callback `id`.
    pub fn register_callback(&self, id: usize, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.write().insert(id, Arc::new(handler));
    }

    // ========================================================================
    // Callback data
    // ========================================================================

    /// Make `data` passable to callbacks.
    pub fn register_data(&self, data: usize) -> EngineResult<()> {
        if data == 0 {
            return Ok(());
        }
        self.asserts.assert("RegisterCallbackData")?;
        self.locks.begin_ordered_atomic_access()?;
        self.data.lock().insert(data);
        self.locks.end_ordered_atomic_access()?;
        Ok(())
    }

    /// Forget `data`.
    pub fn remove_data(&self, data: usize) -> EngineResult<()> {
        self.locks.begin_ordered_atomic_access()?;
        let removed = self.data.lock().remove(data);
        self.locks.end_ordered_atomic_access()?;
        removed.map(|_| ()).ok_or(EngineError::NotRegistered {
            what: "callback data",
            key: data,
        })
    }

    /// Record `*data`, or replace it with the object registered under the
    /// recorded index. Null stays null.
    pub fn save_or_restore_data(&self, data: &mut usize) -> EngineResult<()> {
        let thread = self
            .threads
            .event_thread()?
            .ok_or(ExecError::NotRecorded("save_or_restore_data"))?;
        let mut events = thread.events()?.lock();
        record_or_replay_event(&mut events, ThreadEvent::RestoreCallbackData)?;

        let mut index = 0u64;
        if events.is_recording() && *data != 0 {
            index = self
                .data
                .lock()
                .get_index(*data)
                .ok_or(EngineError::NotRegistered {
                    what: "callback data",
                    key: *data,
                })? as u64;
        }
        events.record_or_replay_scalar(&mut index)?;
        if !events.is_recording() {
            *data = match index {
                0 => 0,
                index => self
                    .data
                    .lock()
                    .get_value(index as usize)
                    .ok_or(EngineError::NotRegistered {
                        what: "callback data index",
                        key: index as usize,
                    })?,
            };
        }
        Ok(())
    }

    // ========================================================================
    // Callback sections
    // ========================================================================

    /// Enter callback `id` from native code running in pass-through mode.
    /// Recording only.
    pub fn begin_callback(&self, id: usize) -> EngineResult<()> {
        let thread = self
            .threads
            .current()
            .filter(|thread| thread.is_recorded() && thread.pass_through())
            .ok_or(ExecError::NotRecorded("begin_callback"))?;
        if !self.threads.file().is_recording() {
            return Err(ExecError::NotRecorded("begin_callback").into());
        }
        thread.end_pass_through();
        let mut events = thread.events()?.lock();
        record_or_replay_event(&mut events, ThreadEvent::ExecuteCallback)?;
        events.write_scalar(id as u64)?;
        Ok(())
    }

    /// Leave the callback entered by [`begin_callback`](Self::begin_callback).
    pub fn end_callback(&self) {
        if !self.threads.file().is_recording() {
            return;
        }
        if let Some(thread) = self.threads.current() {
            thread.begin_pass_through();
        }
    }

    /// Run `native` in pass-through mode while recording, noting the
    /// callbacks it makes. While replaying `native` is skipped and the
    /// recorded callbacks are replayed instead.
    pub fn pass_through_allow_callbacks(&self, native: impl FnOnce()) -> EngineResult<()> {
        let thread = self
            .threads
            .event_thread()?
            .ok_or(ExecError::NotRecorded("pass_through_allow_callbacks"))?;

        if self.threads.file().is_recording() {
            thread.begin_pass_through();
            native();
            thread.end_pass_through();
            record_or_replay_event(&mut thread.events()?.lock(), ThreadEvent::CallbacksFinished)?;
            return Ok(());
        }

        loop {
            let id = {
                let mut events = thread.events()?.lock();
                let tag = replay_any_event(&mut events)?;
                if tag == ThreadEvent::CallbacksFinished as u64 {
                    return Ok(());
                }
                if tag != ThreadEvent::ExecuteCallback as u64 {
                    return Err(ExecError::EventMismatch {
                        recorded: tag,
                        replayed: ThreadEvent::ExecuteCallback,
                    }
                    .into());
                }
                events.read_scalar()? as usize
            };
            self.replay_callback(id)?;
        }
    }

    fn replay_callback(&self, id: usize) -> EngineResult<()> {
        let handler = self
            .handlers
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotRegistered { what: "callback", key: id })?;
        log::trace!("replaying callback {}", id);
        handler();
        Ok(())
    }
}

impl Rewindable for Callbacks {
    type Error = EngineError;

    fn save_state(&self, snapshot: SnapshotId) {
        let data = self.data.lock().clone();
        self.saved.lock().insert(snapshot, data);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let mut saved = self.saved.lock();
        saved.retain(|id, _| *id <= snapshot);
        if let Some(data) = saved.get(&snapshot) {
            *self.data.lock() = data.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{leak, Fixture};
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn callbacks(fx: &Fixture) -> &'static Callbacks {
        leak(Callbacks::new(fx.threads, fx.locks, fx.asserts))
    }

    /// Native code calling back twice into recorded code.
    fn native(callbacks: &Callbacks, seen: &AtomicUsize) {
        for id in [7, 9] {
            callbacks.begin_callback(id).unwrap();
            seen.fetch_add(id, Ordering::SeqCst);
            callbacks.end_callback();
        }
    }

    #[test]
    fn replay_invokes_the_recorded_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        static RECORDED: AtomicUsize = AtomicUsize::new(0);
        static REPLAYED: AtomicUsize = AtomicUsize::new(0);
        {
            let fx = Fixture::new(&dir, "callbacks");
            let callbacks = callbacks(&fx);
            callbacks
                .pass_through_allow_callbacks(|| native(callbacks, &RECORDED))
                .unwrap();
            assert!(!fx.threads.main_thread().pass_through());
            fx.finish();
        }
        assert_eq!(RECORDED.load(Ordering::SeqCst), 16);

        let fx = Fixture::new(&dir, "callbacks");
        let callbacks = callbacks(&fx);
        callbacks.register_callback(7, || {
            REPLAYED.fetch_add(7, Ordering::SeqCst);
        });
        callbacks.register_callback(9, || {
            REPLAYED.fetch_add(9, Ordering::SeqCst);
        });
        callbacks
            .pass_through_allow_callbacks(|| panic!("native code runs only while recording"))
            .unwrap();
        assert_eq!(REPLAYED.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn callback_data_maps_to_the_replayed_object() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fx = Fixture::new(&dir, "data");
            let callbacks = callbacks(&fx);
            callbacks.register_data(0x5000).unwrap();
            let mut data = 0x5000;
            callbacks.save_or_restore_data(&mut data).unwrap();
            let mut null = 0;
            callbacks.save_or_restore_data(&mut null).unwrap();
            fx.finish();
        }
        let fx = Fixture::new(&dir, "data");
        let callbacks = callbacks(&fx);
        callbacks.register_data(0x9000).unwrap();
        let mut data = 0x1;
        callbacks.save_or_restore_data(&mut data).unwrap();
        assert_eq!(data, 0x9000);
        let mut null = 0x2;
        callbacks.save_or_restore_data(&mut null).unwrap();
        assert_eq!(null, 0);
    }

    #[test]
    fn unregistered_data_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new(&dir, "unknown");
        let callbacks = callbacks(&fx);
        let mut data = 0x77;
        assert!(matches!(
            callbacks.save_or_restore_data(&mut data),
            Err(EngineError::NotRegistered { .. })
        ));
        assert!(callbacks.remove_data(0x77).is_err());
    }
}
