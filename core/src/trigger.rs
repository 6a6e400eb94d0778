//! Triggers.
//!
//! A trigger is an object whose callback may be activated from anywhere but
//! runs only at points of the main thread's choosing. The order callbacks
//! ran in while recording is written to the main thread's event stream and
//! replayed exactly, whatever activations happen during replay.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use rewind_execution::{record_or_replay_event, replay_any_event, ExecError, ThreadEvent, Threads};
use rewind_hal::{Rewindable, SnapshotId, SpinLock};

use crate::assert::Assertions;
use crate::error::{EngineError, EngineResult};
use crate::value_index::ValueIndex;

/// Code run when a trigger executes.
pub type TriggerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct TriggerInfo {
    callback: TriggerCallback,
    registered: usize,
}

#[derive(Clone, Default)]
struct TriggerTable {
    ids: ValueIndex,
    info: HashMap<usize, TriggerInfo>,
    activated: Vec<usize>,
}

/// Registered triggers and pending activations.
pub struct Triggers {
    threads: &'static Threads,
    asserts: &'static Assertions,
    table: SpinLock<TriggerTable>,
    saved: SpinLock<BTreeMap<SnapshotId, TriggerTable>>,
}

impl core::fmt::Debug for Triggers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Triggers")
            .field("registered", &table.info.len())
            .field("activated", &table.activated.len())
            .finish()
    }
}

impl Triggers {
    /// No triggers registered.
    pub fn new(threads: &'static Threads, asserts: &'static Assertions) -> Self {
        Self {
            threads,
            asserts,
            table: SpinLock::new(TriggerTable::default()),
            saved: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Register `obj` with `callback`. Registering an object again only
    /// counts the registration; the first callback stays.
    pub fn register(&self, obj: usize, callback: impl Fn() + Send + Sync + 'static) -> EngineResult<()> {
        let main = self
            .threads
            .current()
            .filter(|thread| thread.is_main())
            .ok_or(ExecError::NotMainThread("register_trigger"))?;
        if main.pass_through() || main.events_disallowed() {
            return Err(ExecError::NotRecorded("register_trigger").into());
        }
        if self.threads.has_diverged() {
            return Ok(());
        }

        self.asserts.assert("RegisterTrigger")?;
        record_or_replay_event(&mut main.events()?.lock(), ThreadEvent::RegisterTrigger)?;

        let mut table = self.table.lock();
        if let Some(info) = table.info.get_mut(&obj) {
            info.registered += 1;
            return Ok(());
        }
        table.ids.insert(obj);
        table.info.insert(
            obj,
            TriggerInfo {
                callback: Arc::new(callback),
                registered: 1,
            },
        );
        Ok(())
    }

    /// Drop one registration of `obj`.
    pub fn unregister(&self, obj: usize) -> EngineResult<()> {
        let mut table = self.table.lock();
        let info = table
            .info
            .get_mut(&obj)
            .ok_or(EngineError::NotRegistered { what: "trigger", key: obj })?;
        info.registered -= 1;
        if info.registered == 0 {
            table.info.remove(&obj);
            table.ids.remove(obj);
        }
        Ok(())
    }

    /// Ask for `obj`'s callback to run at the next
    /// [`execute`](Self::execute). Ignored while replaying, where the
    /// recording decides which callbacks run.
    pub fn activate(&self, obj: usize) -> EngineResult<()> {
        if !self.threads.file().is_recording() {
            return Ok(());
        }
        let mut table = self.table.lock();
        let id = table
            .ids
            .get_index(obj)
            .ok_or(EngineError::NotRegistered { what: "trigger", key: obj })?;
        table.activated.push(id);
        Ok(())
    }

    /// Run the callbacks of activated triggers, most recent activation
    /// first. Main thread only.
    pub fn execute(&self) -> EngineResult<()> {
        let main = self
            .threads
            .event_thread()?
            .filter(|thread| thread.is_main())
            .ok_or(ExecError::NotMainThread("execute_triggers"))?;
        self.asserts.assert("ExecuteTriggers")?;

        if self.threads.file().is_recording() {
            loop {
                let Some(id) = self.table.lock().activated.pop() else {
                    break;
                };
                {
                    let mut events = main.events()?.lock();
                    record_or_replay_event(&mut events, ThreadEvent::ExecuteTrigger)?;
                    events.write_scalar(id as u64)?;
                }
                self.invoke(id)?;
            }
            record_or_replay_event(&mut main.events()?.lock(), ThreadEvent::ExecuteTriggersFinished)?;
        } else {
            loop {
                let id = {
                    let mut events = main.events()?.lock();
                    let tag = replay_any_event(&mut events)?;
                    if tag == ThreadEvent::ExecuteTriggersFinished as u64 {
                        break;
                    }
                    if tag != ThreadEvent::ExecuteTrigger as u64 {
                        return Err(EngineError::TriggerMismatch);
                    }
                    events.read_scalar()? as usize
                };
                self.invoke(id)?;
            }
        }

        self.asserts.assert("ExecuteTriggers DONE")
    }

    fn invoke(&self, id: usize) -> EngineResult<()> {
        let callback = {
            let table = self.table.lock();
            table
                .ids
                .get_value(id)
                .and_then(|obj| table.info.get(&obj))
                .map(|info| Arc::clone(&info.callback))
        };
        match callback {
            Some(callback) => {
                log::trace!("executing trigger {}", id);
                callback();
                Ok(())
            }
            // Unregistered after activation.
            None if self.threads.file().is_recording() => Ok(()),
            None => Err(EngineError::NotRegistered {
                what: "trigger id",
                key: id,
            }),
        }
    }

    /// Pending activations.
    pub fn pending(&self) -> usize {
        self.table.lock().activated.len()
    }
}

impl Rewindable for Triggers {
    type Error = EngineError;

    fn save_state(&self, snapshot: SnapshotId) {
        let table = self.table.lock().clone();
        self.saved.lock().insert(snapshot, table);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let mut saved = self.saved.lock();
        saved.retain(|id, _| *id <= snapshot);
        if let Some(table) = saved.get(&snapshot) {
            *self.table.lock() = table.clone();
        }
        Ok(())
    }
}
