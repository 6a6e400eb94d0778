//! # Rewind Engine Core
//!
//! Deterministic record/replay with time travel. A recording process logs
//! every non-deterministic input of its recorded threads into a [`File`];
//! a replaying process feeds the same inputs back and can rewind to any
//! earlier snapshot.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌────────────────────────────────────┐
//!   application ──────▶ │ Engine                             │
//!   (recorded threads)  │  record_replay_value / _bytes      │
//!                       │  take_snapshot / restore_..resume  │
//!                       │  callbacks, triggers, weak ptrs    │
//!                       └──┬──────────────┬───────────────┬──┘
//!                          │              │               │
//!                    ┌─────▼─────┐  ┌─────▼──────┐  ┌─────▼──────┐
//!                    │ Threads   │  │ Memory     │  │ File       │
//!                    │ Locks     │  │ Snapshots  │  │ Streams    │
//!                    └───────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Errors
//!
//! Operations that can fail return [`EngineResult`]. The engine's own entry
//! points route errors through [`Engine::recover`]: running past the end of
//! the recording, or a recorded event after diverging, rewinds to an
//! earlier snapshot; anything else is reported through
//! [`rewind_hal::fatal`] and parks the failing thread.
//!
//! [`File`]: rewindfs::File

#![deny(unsafe_op_in_unsafe_fn)]

pub mod assert;
pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod record;
pub mod rewind;
pub mod thing;
pub mod trigger;
pub mod value_index;
pub mod weak_pointer;

#[cfg(test)]
mod testing;

use core::sync::atomic::{AtomicU32, Ordering};

pub use assert::{dump_recording_assertions, Assertions};
pub use callback::Callbacks;
pub use config::{EngineConfig, Mode};
pub use engine::Engine;
pub use error::{Disposition, EngineError, EngineResult};
pub use hooks::{EngineHooks, NoHooks};
pub use rewind::MainThreadCallback;
pub use thing::Things;
pub use trigger::Triggers;
pub use value_index::ValueIndex;
pub use weak_pointer::WeakPointers;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EngineState {
    /// No engine was started
    Uninitialized = 0,
    /// Tables are being set up
    Initializing  = 1,
    /// Recording or replaying
    Running       = 2,
    /// Restoring a snapshot
    Rewinding     = 3,
    /// A fatal error was reported
    Failed        = 4,
}

impl From<u32> for EngineState {
    fn from(value: u32) -> Self {
        match value {
            0 => EngineState::Uninitialized,
            1 => EngineState::Initializing,
            2 => EngineState::Running,
            3 => EngineState::Rewinding,
            _ => EngineState::Failed,
        }
    }
}

static ENGINE_STATE: AtomicU32 = AtomicU32::new(EngineState::Uninitialized as u32);

static ENGINE: spin::Once<Engine> = spin::Once::new();

static BOOTSTRAP_FAILURE: spin::Once<String> = spin::Once::new();

/// Get the current engine state
pub fn engine_state() -> EngineState {
    EngineState::from(ENGINE_STATE.load(Ordering::SeqCst))
}

pub(crate) fn set_engine_state(state: EngineState) {
    ENGINE_STATE.store(state as u32, Ordering::SeqCst);
}

/// The engine of this process, once initialized.
pub fn engine() -> Option<&'static Engine> {
    ENGINE.get()
}

/// Why bootstrap failed, if it did.
pub fn bootstrap_failure() -> Option<&'static str> {
    BOOTSTRAP_FAILURE.get().map(String::as_str)
}

/// Start the engine on the calling thread, which becomes the main recorded
/// thread. Returns `None` when `config` neither records nor replays.
///
/// A bootstrap failure is latched: this and every later call report it.
pub fn initialize(config: EngineConfig, hooks: Box<dyn EngineHooks>) -> EngineResult<Option<&'static Engine>> {
    if config.spew {
        log::set_max_level(log::LevelFilter::Debug);
    }
    if !config.mode.is_active() {
        log::debug!("record/replay inactive ({:?})", config.mode);
        return Ok(None);
    }
    if let Some(failure) = bootstrap_failure() {
        return Err(EngineError::Bootstrap(failure.to_owned()));
    }
    if ENGINE.is_completed() {
        return Err(EngineError::Bootstrap("already initialized".into()));
    }

    set_engine_state(EngineState::Initializing);
    let engine = ENGINE.try_call_once(|| Engine::bootstrap(config, hooks));
    match engine {
        Ok(engine) => {
            rewind_hal::fatal::register_fatal_handler(engine);
            set_engine_state(EngineState::Running);
            log::info!("record/replay engine running");
            Ok(Some(engine))
        }
        Err(err) => {
            let message = BOOTSTRAP_FAILURE.call_once(|| err.to_string());
            log::error!("record/replay bootstrap failed: {}", message);
            set_engine_state(EngineState::Failed);
            Err(EngineError::Bootstrap(message.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u32() {
        for state in [
            EngineState::Uninitialized,
            EngineState::Initializing,
            EngineState::Running,
            EngineState::Rewinding,
            EngineState::Failed,
        ] {
            assert_eq!(EngineState::from(state as u32), state);
        }
        assert_eq!(EngineState::from(77), EngineState::Failed);
    }

    #[test]
    fn inactive_modes_start_nothing() {
        let config = EngineConfig::new(Mode::Middleman);
        assert!(initialize(config, Box::new(NoHooks)).unwrap().is_none());
        assert!(engine().is_none());
    }
}
