//! # Engine Context
//!
//! The engine owns every table of the process: the recording file, the
//! thread and lock tables, tracked memory, and the registries layered on
//! top of them. Tables that other tables borrow are leaked at bootstrap and
//! live for the rest of the process, like the threads they describe.

use std::path::Path;
use std::sync::Arc;

use rewind_execution::{Locks, Threads};
use rewind_hal::fatal::FatalHandler;
use rewind_hal::SpinLock;
use rewind_memory::MemorySnapshots;
use rewindfs::{File, StreamName};

use crate::assert::{dump_recording_assertions, Assertions};
use crate::callback::Callbacks;
use crate::config::{EngineConfig, Mode};
use crate::error::{EngineError, EngineResult};
use crate::hooks::EngineHooks;
use crate::rewind::RewindState;
use crate::thing::Things;
use crate::trigger::Triggers;
use crate::weak_pointer::WeakPointers;

/// Give `value` the lifetime of the process.
pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// The record/replay engine of this process.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) file: Arc<File>,
    pub(crate) threads: &'static Threads,
    pub(crate) locks: &'static Locks,
    pub(crate) memory: &'static MemorySnapshots,
    pub(crate) asserts: &'static Assertions,
    pub(crate) things: Things,
    pub(crate) callbacks: Callbacks,
    pub(crate) triggers: Triggers,
    pub(crate) weak_pointers: WeakPointers,
    pub(crate) rewind: RewindState,
    pub(crate) hooks: Box<dyn EngineHooks>,
    /// First reason the recording was invalidated.
    pub(crate) invalid: SpinLock<Option<String>>,
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.config.mode)
            .field("recording", &self.file.is_recording())
            .field("last_snapshot", &self.last_snapshot())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Bring up every table, in dependency order. The calling thread
    /// becomes the main recorded thread.
    pub(crate) fn bootstrap(config: EngineConfig, hooks: Box<dyn EngineHooks>) -> EngineResult<Self> {
        let file = match &config.mode {
            Mode::Record(path) => File::create(path)?,
            Mode::Replay(path) => File::open(path)?,
            mode => return Err(EngineError::Config(format!("no engine runs in {:?} mode", mode))),
        };
        log::info!(
            "{} {}",
            if file.is_recording() { "recording to" } else { "replaying" },
            file.path().display()
        );
        let file = Arc::new(file);

        let threads = leak(Threads::new(config.thread_config(), Arc::clone(&file))?);
        threads.initialize()?;

        if let Some(path) = &config.dump_recording {
            let dumped = dump_recording_assertions(path)?;
            log::info!("dumped {} assertions from {}", dumped, path.display());
        }

        let locks = leak(Locks::new(threads)?);
        let asserts = leak(Assertions::new(threads));
        let things = Things::new(threads, locks);
        let callbacks = Callbacks::new(threads, locks, asserts);
        let triggers = Triggers::new(threads, asserts);
        let weak_pointers = WeakPointers::new(threads, locks, asserts);
        if !file.is_recording() {
            if file.stream_keys().contains(&(StreamName::WeakPointer, 0)) {
                weak_pointers.read_table(&file)?;
            } else {
                log::warn!("{} has no weak pointer table", file.path().display());
            }
        }

        let memory = leak(MemorySnapshots::new(config.memory_config())?);
        for thread in (1..).map_while(|id| threads.get(id)) {
            if let Some(stack) = thread.stack() {
                memory.note_thread_stack(stack);
            }
        }

        Ok(Self {
            config,
            file,
            threads,
            locks,
            memory,
            asserts,
            things,
            callbacks,
            triggers,
            weak_pointers,
            rewind: RewindState::new(),
            hooks,
            invalid: SpinLock::new(None),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Settings the engine started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The recording.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Whether the process is still recording. Turns false at the first
    /// rewind.
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.file.is_recording()
    }

    /// Path of the recording.
    pub fn recording_path(&self) -> &Path {
        self.file.path()
    }

    /// Recorded threads.
    pub fn threads(&self) -> &'static Threads {
        self.threads
    }

    /// Recorded locks.
    pub fn locks(&self) -> &'static Locks {
        self.locks
    }

    /// Tracked memory.
    pub fn memory(&self) -> &'static MemorySnapshots {
        self.memory
    }

    /// Record/replay assertions.
    pub fn assertions(&self) -> &'static Assertions {
        self.asserts
    }

    /// Diagnostic thing registry.
    pub fn things(&self) -> &Things {
        &self.things
    }

    /// Native callbacks.
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Triggers.
    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    /// Weak pointers.
    pub fn weak_pointers(&self) -> &WeakPointers {
        &self.weak_pointers
    }

    /// Record `text`, or check it against the recording.
    pub fn assert(&self, text: &str) {
        self.recover(self.asserts.assert(text));
    }

    /// Record `data`, or check it against the recording.
    pub fn assert_bytes(&self, data: &[u8]) {
        self.recover(self.asserts.assert_bytes(data));
    }
}

impl FatalHandler for Engine {
    fn handle_fatal(&self, message: &str) {
        crate::set_engine_state(crate::EngineState::Failed);
        self.memory.unprotect_all();
        self.hooks.on_fatal(message);
    }
}
