//! Recorded threads.
//!
//! Every recorded thread exists from startup: slots `2..=max_recorded` are
//! spawned up front and idle until the process hands them a start routine.
//! When the routine returns the slot idles again and may be reused. Rewinding
//! therefore never spawns or destroys an OS thread; it only moves existing
//! threads back to earlier stack states.
//!
//! A recorded thread only ever blocks in [`Threads::wait`]. While the main
//! thread coordinates a snapshot or a rewind (`should_idle`), a thread
//! entering `wait` first captures its context so its stack can be saved, then
//! parks until the coordinator lets it go or tells it to restore an older
//! stack.
//!
//! ```text
//!   main                              thread n
//!   ────                              ────────
//!   wait_for_idle_threads()           wait(): capture context, idle = true
//!     should_idle = true     ───────▶ notify main
//!     all idle? ◀────────────────────
//!   save_all_threads(s)               (parked)
//!   resume_idle_threads()    ───────▶ leave wait()
//! ```
//!
//! Slots past `max_recorded` belong to non-recorded helper threads. They use
//! the same wakeup pipes but never idle and never appear in a recording.

use core::cell::Cell;
use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use rewind_hal::pipe::Pipe;
use rewind_hal::stack::{current_thread_stack, StackBounds};
use rewind_hal::{Rewindable, SnapshotId, SpinLock};
use rewindfs::{File, FileMode, StreamHandle, StreamName};

use crate::call::CallEventHelper;
use crate::error::{ExecError, ExecResult};
use crate::event::{record_or_replay_event, ThreadEvent};
use crate::snapshot::ThreadSnapshots;

// ============================================================================
// Constants and configuration
// ============================================================================

/// Identifier of a thread slot. Recorded ids are stable across executions.
pub type ThreadId = usize;

/// Id of the process main thread.
pub const MAIN_THREAD_ID: ThreadId = 1;

/// Highest recorded thread id.
pub const DEFAULT_MAX_RECORDED_THREAD_ID: usize = 70;

/// Slots for threads that take part in waits but are not recorded.
pub const DEFAULT_MAX_NON_RECORDED_THREADS: usize = 24;

/// Helper threads running off-thread call events.
pub const DEFAULT_CALL_EVENT_HELPERS: usize = 12;

/// Recent assertions remembered per thread.
pub const RECENT_ASSERTS: usize = 128;

static_assertions::const_assert!(DEFAULT_CALL_EVENT_HELPERS <= DEFAULT_MAX_NON_RECORDED_THREADS);

/// Start routine of a recorded thread.
pub type StartRoutine = fn(usize);

/// Callback that lets a thread blocked outside the lock model make progress.
pub type UnrecordedWaitCallback = Arc<dyn Fn() + Send + Sync>;

/// Thread table settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadConfig {
    /// Highest recorded thread id
    pub max_recorded_thread_id: usize,
    /// Non-recorded thread slots
    pub max_non_recorded_threads: usize,
    /// Call event helper threads, taken from the non-recorded slots
    pub call_event_helpers: usize,
    /// Prefix of the per-snapshot stack files
    pub stack_file_prefix: String,
}

impl ThreadConfig {
    /// Defaults with stack files under `stack_file_prefix`.
    pub fn new(stack_file_prefix: impl Into<String>) -> Self {
        Self {
            max_recorded_thread_id: DEFAULT_MAX_RECORDED_THREAD_ID,
            max_non_recorded_threads: DEFAULT_MAX_NON_RECORDED_THREADS,
            call_event_helpers: DEFAULT_CALL_EVENT_HELPERS,
            stack_file_prefix: stack_file_prefix.into(),
        }
    }

    /// Use recorded ids `1..=max_id`.
    pub fn with_recorded_threads(mut self, max_id: usize) -> Self {
        self.max_recorded_thread_id = max_id.max(MAIN_THREAD_ID);
        self
    }

    /// Use `count` call event helpers.
    pub fn with_call_event_helpers(mut self, count: usize) -> Self {
        self.call_event_helpers = count;
        self.max_non_recorded_threads = self.max_non_recorded_threads.max(count);
        self
    }

    fn max_thread_id(&self) -> usize {
        self.max_recorded_thread_id + self.max_non_recorded_threads
    }
}

// ============================================================================
// Thread
// ============================================================================

thread_local! {
    /// `(table address, thread id)` bound to the calling OS thread.
    static CURRENT: Cell<(usize, ThreadId)> = const { Cell::new((0, 0)) };
}

#[derive(Debug, Clone, Copy, Default)]
struct Routine {
    start: Option<(StartRoutine, usize)>,
    /// Started joinable and not joined yet
    joinable: bool,
}

impl Routine {
    fn is_free(&self) -> bool {
        self.start.is_none() && !self.joinable
    }
}

#[derive(Default)]
struct UnrecordedWait {
    callback: Option<UnrecordedWaitCallback>,
    /// Invoked since the main thread started waiting for idle threads
    notified: bool,
}

impl fmt::Debug for UnrecordedWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnrecordedWait")
            .field("callback", &self.callback.is_some())
            .field("notified", &self.notified)
            .finish()
    }
}

/// One thread slot.
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    recorded: bool,
    events: Option<StreamHandle>,
    asserts: Option<StreamHandle>,
    pub(crate) pipe: Pipe,
    bound: AtomicBool,
    idle: AtomicBool,
    pass_through: AtomicUsize,
    disallow: AtomicUsize,
    pub(crate) wait_lock: AtomicUsize,
    wait_cvar: AtomicUsize,
    wait_thread: AtomicUsize,
    routine: SpinLock<Routine>,
    stack: SpinLock<Option<StackBounds>>,
    stack_end: AtomicUsize,
    unrecorded_wait: SpinLock<UnrecordedWait>,
    recent_asserts: SpinLock<VecDeque<String>>,
}

impl Thread {
    fn new(id: ThreadId, recorded: bool, file: &File) -> ExecResult<Self> {
        let (events, asserts) = if recorded {
            (
                Some(file.open_stream(StreamName::Event, id)),
                Some(file.open_stream(StreamName::Assert, id)),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            id,
            recorded,
            events,
            asserts,
            pipe: Pipe::new()?,
            bound: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            pass_through: AtomicUsize::new(0),
            disallow: AtomicUsize::new(0),
            wait_lock: AtomicUsize::new(0),
            wait_cvar: AtomicUsize::new(0),
            wait_thread: AtomicUsize::new(0),
            routine: SpinLock::new(Routine::default()),
            stack: SpinLock::new(None),
            stack_end: AtomicUsize::new(0),
            unrecorded_wait: SpinLock::new(UnrecordedWait::default()),
            recent_asserts: SpinLock::new(VecDeque::new()),
        })
    }

    /// Slot id.
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Whether this is the process main thread.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.id == MAIN_THREAD_ID
    }

    /// Whether the thread's events are recorded.
    #[inline]
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    /// Event stream of a recorded thread.
    pub fn events(&self) -> ExecResult<&StreamHandle> {
        self.events.as_ref().ok_or(ExecError::NotRecorded("event stream"))
    }

    /// Assertion stream of a recorded thread.
    pub fn asserts(&self) -> ExecResult<&StreamHandle> {
        self.asserts.as_ref().ok_or(ExecError::NotRecorded("assertion stream"))
    }

    /// Whether events on this thread pass through unrecorded.
    #[inline]
    pub fn pass_through(&self) -> bool {
        !self.recorded || self.pass_through.load(Ordering::Relaxed) != 0
    }

    /// Enter a pass-through section. Sections nest.
    pub fn begin_pass_through(&self) {
        self.pass_through.fetch_add(1, Ordering::Relaxed);
    }

    /// Leave a pass-through section.
    pub fn end_pass_through(&self) {
        let previous = self.pass_through.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unbalanced pass-through on thread {}", self.id);
    }

    /// Whether recorded events are currently a bug on this thread.
    #[inline]
    pub fn events_disallowed(&self) -> bool {
        self.disallow.load(Ordering::Relaxed) != 0
    }

    /// Enter a section in which recorded events are forbidden.
    pub fn begin_disallow_events(&self) {
        self.disallow.fetch_add(1, Ordering::Relaxed);
    }

    /// Leave a disallow section.
    pub fn end_disallow_events(&self) {
        let previous = self.disallow.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unbalanced disallow on thread {}", self.id);
    }

    /// Whether the thread is parked in its idle state.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Whether the thread currently has a start routine.
    pub fn is_running(&self) -> bool {
        self.is_main() || self.routine.lock().start.is_some()
    }

    /// Full stack mapping of the thread, once bound.
    pub fn stack(&self) -> Option<StackBounds> {
        *self.stack.lock()
    }

    /// Upper end of the stack range saved in thread snapshots.
    pub fn stack_end(&self) -> usize {
        self.stack_end.load(Ordering::Acquire)
    }

    /// Remember an assertion for mismatch reports.
    pub fn note_assert(&self, text: String) {
        let mut recent = self.recent_asserts.lock();
        if recent.len() == RECENT_ASSERTS {
            recent.pop_front();
        }
        recent.push_back(text);
    }

    /// Recent assertions, oldest first.
    pub fn recent_asserts(&self) -> Vec<String> {
        self.recent_asserts.lock().iter().cloned().collect()
    }
}

// ============================================================================
// Thread table
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SavedThread {
    pass_through: usize,
    disallow: usize,
    wait_lock: usize,
    wait_cvar: usize,
    wait_thread: usize,
    routine: Routine,
}

/// Every thread slot and the idle/resume protocol between them.
#[derive(Debug)]
pub struct Threads {
    config: ThreadConfig,
    file: Arc<File>,
    threads: Vec<Thread>,
    pub(crate) snapshots: ThreadSnapshots,
    pub(crate) helpers: Vec<CallEventHelper>,
    start_lock: SpinLock<()>,
    should_idle: AtomicBool,
    are_idle: AtomicBool,
    pub(crate) active_call_events: AtomicUsize,
    non_recorded: AtomicUsize,
    diverged: AtomicBool,
    saved: SpinLock<BTreeMap<SnapshotId, Vec<SavedThread>>>,
}

impl Threads {
    /// Create every thread slot. Nothing is spawned until
    /// [`initialize`](Self::initialize).
    pub fn new(config: ThreadConfig, file: Arc<File>) -> ExecResult<Self> {
        let threads = (MAIN_THREAD_ID..=config.max_thread_id())
            .map(|id| Thread::new(id, id <= config.max_recorded_thread_id, &file))
            .collect::<ExecResult<Vec<_>>>()?;
        let helpers = (0..config.call_event_helpers)
            .map(|_| CallEventHelper::new())
            .collect();
        Ok(Self {
            snapshots: ThreadSnapshots::new(config.max_recorded_thread_id),
            helpers,
            config,
            file,
            threads,
            start_lock: SpinLock::new(()),
            should_idle: AtomicBool::new(false),
            are_idle: AtomicBool::new(false),
            active_call_events: AtomicUsize::new(0),
            non_recorded: AtomicUsize::new(0),
            diverged: AtomicBool::new(false),
            saved: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Bind the calling thread as the main thread, then spawn every other
    /// recorded thread and the call event helpers.
    pub fn initialize(&'static self) -> ExecResult<()> {
        let stack = current_thread_stack()?;
        self.bind(MAIN_THREAD_ID, stack, stack.end);

        for id in MAIN_THREAD_ID + 1..=self.config.max_recorded_thread_id {
            self.spawn(id)?;
        }
        for index in 0..self.helpers.len() {
            self.spawn_call_event_helper(index)?;
        }
        log::debug!(
            "{} recorded threads, {} call event helpers",
            self.config.max_recorded_thread_id,
            self.helpers.len()
        );
        Ok(())
    }

    /// Settings in use.
    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// The recording this table writes to or reads from.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    #[inline]
    fn is_recording(&self) -> bool {
        self.file.is_recording()
    }

    /// Slot `id`, if it exists.
    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        id.checked_sub(MAIN_THREAD_ID).and_then(|i| self.threads.get(i))
    }

    fn slot(&self, id: ThreadId) -> &Thread {
        &self.threads[id - MAIN_THREAD_ID]
    }

    /// The main thread.
    pub fn main_thread(&self) -> &Thread {
        self.slot(MAIN_THREAD_ID)
    }

    /// Recorded threads, main thread first.
    pub fn recorded(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.threads[..self.config.max_recorded_thread_id].iter()
    }

    fn recorded_non_main(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.recorded().skip(1)
    }

    /// Id of the calling thread in this table.
    pub fn current_id(&self) -> Option<ThreadId> {
        let (table, id) = CURRENT.with(Cell::get);
        (table == self as *const Self as usize && id != 0).then_some(id)
    }

    /// Slot of the calling thread.
    pub fn current(&self) -> Option<&Thread> {
        self.current_id().map(|id| self.slot(id))
    }

    /// Whether the caller is the main thread.
    pub fn current_is_main(&self) -> bool {
        self.current_id() == Some(MAIN_THREAD_ID)
    }

    pub(crate) fn require_main(&self, operation: &'static str) -> ExecResult<&Thread> {
        match self.current() {
            Some(thread) if thread.is_main() => Ok(thread),
            _ => Err(ExecError::NotMainThread(operation)),
        }
    }

    /// The calling thread when it may record or replay an event, `None` when
    /// its events pass through.
    pub fn event_thread(&self) -> ExecResult<Option<&Thread>> {
        let Some(thread) = self.current() else {
            return Ok(None);
        };
        if thread.pass_through() {
            return Ok(None);
        }
        if thread.events_disallowed() {
            return Err(ExecError::EventsDisallowed(thread.id));
        }
        if self.has_diverged() {
            return Err(ExecError::Diverged(thread.id));
        }
        Ok(Some(thread))
    }

    /// Whether execution has diverged from the recording.
    #[inline]
    pub fn has_diverged(&self) -> bool {
        self.diverged.load(Ordering::SeqCst)
    }

    /// Mark execution as diverged. Cleared by a rewind.
    pub fn set_diverged(&self, diverged: bool) {
        self.diverged.store(diverged, Ordering::SeqCst);
    }

    /// Whether the main thread is collecting idle threads.
    #[inline]
    pub fn should_idle(&self) -> bool {
        self.should_idle.load(Ordering::SeqCst)
    }

    /// Whether every recorded thread is known to be idle.
    #[inline]
    pub fn are_idle(&self) -> bool {
        self.are_idle.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    fn bind(&self, id: ThreadId, stack: StackBounds, stack_end: usize) {
        CURRENT.with(|current| current.set((self as *const Self as usize, id)));
        let thread = self.slot(id);
        *thread.stack.lock() = Some(stack);
        thread.stack_end.store(stack_end, Ordering::Release);
        thread.bound.store(true, Ordering::Release);
        if id != MAIN_THREAD_ID {
            self.notify(MAIN_THREAD_ID);
        }
    }

    fn wait_until_bound(&self, id: ThreadId) {
        let main = self.main_thread();
        while !self.slot(id).bound.load(Ordering::Acquire) {
            main.pipe.wait();
        }
    }

    fn spawn(&'static self, id: ThreadId) -> ExecResult<()> {
        std::thread::Builder::new()
            .name(format!("rewind-thread-{}", id))
            .spawn(move || self.thread_main(id))
            .map_err(ExecError::Spawn)?;
        self.wait_until_bound(id);
        Ok(())
    }

    /// Spawn a non-recorded thread running `body` with its own slot.
    pub(crate) fn spawn_non_recorded(
        &'static self,
        name: String,
        body: impl FnOnce(ThreadId) + Send + 'static,
    ) -> ExecResult<ThreadId> {
        let index = self.non_recorded.fetch_add(1, Ordering::SeqCst);
        if index >= self.config.max_non_recorded_threads {
            return Err(ExecError::TooManyHelpers);
        }
        let id = self.config.max_recorded_thread_id + 1 + index;
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let anchor = 0u8;
                let stack = match current_thread_stack() {
                    Ok(stack) => stack,
                    Err(err) => rewind_hal::fatal!("non-recorded thread {}: {}", id, err),
                };
                self.bind(id, stack, core::ptr::addr_of!(anchor) as usize);
                body(id);
            })
            .map_err(ExecError::Spawn)?;
        self.wait_until_bound(id);
        Ok(id)
    }

    /// Root of every spawned recorded thread. The anchor local bounds the
    /// stack range that thread snapshots save.
    fn thread_main(&'static self, id: ThreadId) {
        let anchor = 0u8;
        let stack = match current_thread_stack() {
            Ok(stack) => stack,
            Err(err) => rewind_hal::fatal!("recorded thread {}: {}", id, err),
        };
        self.bind(id, stack, core::ptr::addr_of!(anchor) as usize);
        self.run_routines(self.slot(id));
    }

    #[inline(never)]
    fn run_routines(&self, thread: &Thread) -> ! {
        loop {
            let (routine, argument) = loop {
                if let Some(start) = thread.routine.lock().start {
                    break start;
                }
                if let Err(err) = self.wait_on(thread) {
                    rewind_hal::fatal!("thread {} idling: {}", thread.id, err);
                }
            };

            routine(argument);

            thread.routine.lock().start = None;
            self.notify_waiters_for_thread(thread.id);
        }
    }

    // ========================================================================
    // Starting and joining
    // ========================================================================

    /// Run `routine(argument)` on an idle recorded thread. The slot chosen
    /// while recording is replayed. Returns the slot id.
    pub fn start_thread(
        &self,
        routine: StartRoutine,
        argument: usize,
        joinable: bool,
    ) -> ExecResult<ThreadId> {
        let thread = self
            .event_thread()?
            .ok_or(ExecError::NotRecorded("start_thread"))?;

        // Choosing a slot and claiming it happen under one lock while
        // recording. Replay never chooses, so it never takes the lock.
        let guard = self.is_recording().then(|| self.start_lock.lock());
        let mut id = 0u64;
        if guard.is_some() {
            let free = self
                .recorded_non_main()
                .find(|t| t.routine.lock().is_free())
                .ok_or(ExecError::TooManyThreads)?;
            id = free.id as u64;
        }
        {
            let mut events = thread.events()?.lock();
            record_or_replay_event(&mut events, ThreadEvent::CreateThread)?;
            events.record_or_replay_scalar(&mut id)?;
        }
        let target = usize::try_from(id)
            .ok()
            .filter(|&id| id > MAIN_THREAD_ID && id <= self.config.max_recorded_thread_id)
            .map(|id| self.slot(id))
            .ok_or(ExecError::BadThreadId(id))?;

        // Replay may reach this point before the slot's previous routine has
        // finished.
        loop {
            {
                let mut slot = target.routine.lock();
                if slot.is_free() {
                    slot.start = Some((routine, argument));
                    slot.joinable = joinable;
                    break;
                }
            }
            debug_assert!(guard.is_none());
            thread.wait_thread.store(target.id, Ordering::SeqCst);
            if !target.routine.lock().is_free() {
                self.wait_on(thread)?;
            }
            thread.wait_thread.store(0, Ordering::SeqCst);
        }
        drop(guard);

        log::trace!("thread {} started thread {}", thread.id, target.id);
        self.notify(target.id);
        Ok(target.id)
    }

    /// Block until the routine started on `id` has returned.
    pub fn join_thread(&self, id: ThreadId) -> ExecResult<()> {
        let thread = self.current().ok_or(ExecError::NotRecorded("join_thread"))?;
        let target = self
            .get(id)
            .filter(|t| t.recorded && !t.is_main())
            .ok_or(ExecError::BadThreadId(id as u64))?;
        loop {
            {
                let mut routine = target.routine.lock();
                if !routine.joinable {
                    return Err(ExecError::NotJoinable(id));
                }
                if routine.start.is_none() {
                    routine.joinable = false;
                    return Ok(());
                }
            }
            thread.wait_thread.store(id, Ordering::SeqCst);
            if target.routine.lock().start.is_some() {
                self.wait_on(thread)?;
            }
            thread.wait_thread.store(0, Ordering::SeqCst);
        }
    }

    /// Thread whose routine `thread` is waiting on, if any.
    pub(crate) fn joining(&self, thread: &Thread) -> Option<ThreadId> {
        match thread.wait_thread.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    fn notify_waiters_for_thread(&self, id: ThreadId) {
        for thread in &self.threads {
            if thread.wait_thread.load(Ordering::SeqCst) == id {
                thread.pipe.notify();
            }
        }
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Wake thread `id` from one wait, or make its next wait return at once.
    pub fn notify(&self, id: ThreadId) {
        if let Some(thread) = self.get(id) {
            thread.pipe.notify();
        }
    }

    /// Block the calling thread until notified. A recorded thread enters its
    /// idle state here if the main thread is collecting idle threads.
    pub fn wait(&self) -> ExecResult<()> {
        let thread = self.current().ok_or(ExecError::NotRecorded("wait"))?;
        self.wait_on(thread)
    }

    /// Block until notified, never idling.
    pub fn wait_no_idle(&self) -> ExecResult<()> {
        let thread = self.current().ok_or(ExecError::NotRecorded("wait_no_idle"))?;
        thread.pipe.wait();
        Ok(())
    }

    /// Wait until the process rewinds.
    pub fn wait_forever(&self) -> ExecResult<Infallible> {
        loop {
            self.wait()?;
        }
    }

    /// The separator local sits in this frame; everything the idle state
    /// changes lives below it, in the captured stack top.
    pub(crate) fn wait_on(&self, thread: &Thread) -> ExecResult<()> {
        if thread.is_main() || thread.pass_through() {
            thread.pipe.wait();
            return Ok(());
        }
        let separator = 0u8;
        self.idle(thread, core::ptr::addr_of!(separator))
    }

    #[inline(never)]
    fn idle(&self, thread: &Thread, separator: *const u8) -> ExecResult<()> {
        thread.begin_pass_through();
        match self.snapshots.save_thread_state(thread.id, separator) {
            Ok(true) => {}
            Ok(false) => {
                // Back from a rewind; the main thread waits for every stack.
                self.notify(MAIN_THREAD_ID);
            }
            Err(err) => {
                thread.end_pass_through();
                return Err(err);
            }
        }

        thread.idle.store(true, Ordering::SeqCst);
        if self.should_idle() {
            self.notify(MAIN_THREAD_ID);
        }

        loop {
            thread.pipe.wait();
            if self.snapshots.should_restore(thread.id) {
                // SAFETY: this thread is idle and owns the loaded stack image
                unsafe { self.snapshots.restore_thread_stack(thread.id) };
            }
            if !self.should_idle() {
                break;
            }
        }

        thread.idle.store(false, Ordering::SeqCst);
        thread.end_pass_through();
        Ok(())
    }

    /// Register the callback the main thread invokes when it waits for this
    /// thread to idle while the thread is blocked outside the lock model.
    pub fn notify_unrecorded_wait(&self, callback: impl Fn() + Send + Sync + 'static) -> ExecResult<()> {
        let thread = self
            .current()
            .ok_or(ExecError::NotRecorded("notify_unrecorded_wait"))?;
        {
            let mut wait = thread.unrecorded_wait.lock();
            // A new registration must be invoked again even if the previous
            // one already was during this idle collection.
            wait.notified = false;
            wait.callback = Some(Arc::new(callback));
        }
        if self.should_idle() {
            self.notify(MAIN_THREAD_ID);
        }
        Ok(())
    }

    /// Idle here if the main thread is collecting idle threads.
    pub fn maybe_wait_for_snapshot(&self) -> ExecResult<()> {
        while self.should_idle() {
            self.wait()?;
        }
        Ok(())
    }

    // ========================================================================
    // Idling (main thread)
    // ========================================================================

    /// Bring every recorded thread into its idle state.
    pub fn wait_for_idle_threads(&self) -> ExecResult<()> {
        let main = self.require_main("wait_for_idle_threads")?;
        debug_assert!(!self.should_idle() && !self.are_idle());
        self.should_idle.store(true, Ordering::SeqCst);

        for thread in self.recorded_non_main() {
            thread.unrecorded_wait.lock().notified = false;
        }

        'scan: loop {
            let mut done = self.active_call_events.load(Ordering::SeqCst) == 0;
            for thread in self.recorded_non_main() {
                if thread.is_idle() {
                    continue;
                }
                done = false;
                let callback = {
                    let mut guard = thread.unrecorded_wait.lock();
                    let wait = &mut *guard;
                    match &wait.callback {
                        Some(callback) if !wait.notified => {
                            wait.notified = true;
                            Some(callback.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(callback) = callback {
                    main.begin_pass_through();
                    callback();
                    main.end_pass_through();
                    continue 'scan;
                }
            }
            if done {
                break;
            }
            main.pipe.wait();
        }

        self.are_idle.store(true, Ordering::SeqCst);
        log::trace!("all recorded threads idle");
        Ok(())
    }

    /// Let idle threads run again.
    pub fn resume_idle_threads(&self) -> ExecResult<()> {
        self.require_main("resume_idle_threads")?;
        debug_assert!(self.are_idle() && self.should_idle());
        self.are_idle.store(false, Ordering::SeqCst);
        self.should_idle.store(false, Ordering::SeqCst);

        // Helpers may be parked in end_off_thread_call_event.
        for thread in &self.threads[self.config.max_recorded_thread_id..] {
            thread.pipe.notify();
        }
        for thread in self.recorded_non_main() {
            thread.pipe.notify();
        }
        Ok(())
    }

    // ========================================================================
    // Condition variables
    // ========================================================================

    /// Release the caller's lock with `release` and block until `cvar` is
    /// signaled. While replaying, the wakeup order follows from the
    /// recorded lock order instead, so this only releases the lock.
    pub fn wait_for_cvar(&self, cvar: usize, release: impl FnOnce()) -> ExecResult<()> {
        if !self.is_recording() {
            release();
            return Ok(());
        }
        let thread = self.current().ok_or(ExecError::NotRecorded("wait_for_cvar"))?;
        debug_assert_eq!(thread.wait_cvar.load(Ordering::SeqCst), 0);
        thread.wait_cvar.store(cvar, Ordering::SeqCst);
        release();
        while self.is_recording() && thread.wait_cvar.load(Ordering::SeqCst) != 0 {
            self.wait_on(thread)?;
        }
        Ok(())
    }

    /// Like [`wait_for_cvar`](Self::wait_for_cvar), giving up once
    /// `timed_out` returns true. Returns whether the cvar was signaled; the
    /// outcome is recorded.
    pub fn wait_for_cvar_until(
        &self,
        cvar: usize,
        release: impl FnOnce(),
        mut timed_out: impl FnMut() -> bool,
    ) -> ExecResult<bool> {
        let thread = self
            .event_thread()?
            .ok_or(ExecError::NotRecorded("wait_for_cvar_until"))?;
        record_or_replay_event(&mut thread.events()?.lock(), ThreadEvent::WaitForCvarUntil)?;

        let mut notified = true;
        if self.is_recording() {
            thread.wait_cvar.store(cvar, Ordering::SeqCst);
            release();
            while thread.wait_cvar.load(Ordering::SeqCst) != 0 {
                if self.should_idle() {
                    self.wait_on(thread)?;
                    if !self.is_recording() {
                        break;
                    }
                }
                if timed_out() {
                    notified = thread
                        .wait_cvar
                        .compare_exchange(cvar, 0, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err();
                    break;
                }
                std::thread::yield_now();
            }
        } else {
            release();
        }

        let mut value = u64::from(notified);
        thread.events()?.lock().record_or_replay_scalar(&mut value)?;
        Ok(value != 0)
    }

    /// Wake one or every thread waiting on `cvar`.
    pub fn signal_cvar(&self, cvar: usize, broadcast: bool) {
        if !self.is_recording() {
            return;
        }
        for thread in &self.threads {
            if thread
                .wait_cvar
                .compare_exchange(cvar, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                thread.pipe.notify();
                if !broadcast {
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Snapshots (main thread, all threads idle)
    // ========================================================================

    /// Save every recorded thread's stack for `snapshot`. Returns true right
    /// after saving, and false when execution comes back here because a
    /// later rewind restored this snapshot.
    #[inline(never)]
    pub fn save_all_threads(&self, snapshot: SnapshotId) -> ExecResult<bool> {
        let main = self.require_main("save_all_threads")?;
        debug_assert!(self.are_idle());
        let separator = 0u8;
        if !self.capture_main(main, core::ptr::addr_of!(separator))? {
            return Ok(false);
        }
        self.write_stacks(snapshot)?;
        self.save_state(snapshot);
        Ok(true)
    }

    #[inline(never)]
    fn capture_main(&self, main: &Thread, separator: *const u8) -> ExecResult<bool> {
        main.begin_pass_through();
        let saved = self.snapshots.save_thread_state(MAIN_THREAD_ID, separator);
        // Restoring resets the depth to the one saved after this section.
        if !matches!(saved, Ok(false)) {
            main.end_pass_through();
        }
        saved
    }

    fn write_stacks(&self, snapshot: SnapshotId) -> ExecResult<()> {
        let file = File::open_indexed(&self.config.stack_file_prefix, snapshot, FileMode::Write)?;
        {
            let stream = file.open_stream(StreamName::Main, 0);
            let mut stream = stream.lock();
            for thread in self.recorded() {
                self.snapshots
                    .write_stack(&mut stream, thread.id, thread.stack_end())?;
            }
        }
        file.close()?;
        Ok(())
    }

    /// Load every recorded thread's stack for `snapshot` and restore the
    /// main thread's, which resumes in [`save_all_threads`](Self::save_all_threads).
    /// Other threads restore their own stacks once woken by
    /// [`wait_for_idle_threads_to_restore_their_stacks`](Self::wait_for_idle_threads_to_restore_their_stacks).
    pub fn restore_all_threads(&self, snapshot: SnapshotId) -> ExecResult<Infallible> {
        self.require_main("restore_all_threads")?;
        debug_assert!(self.are_idle());
        self.load_stacks(snapshot)?;
        self.restore_state(snapshot)?;
        // SAFETY: the main thread is running off its own stack image only
        // through heap buffers owned by the snapshots table
        unsafe { self.snapshots.restore_thread_stack(MAIN_THREAD_ID) }
    }

    fn load_stacks(&self, snapshot: SnapshotId) -> ExecResult<()> {
        let file = File::open_indexed(&self.config.stack_file_prefix, snapshot, FileMode::Read)?;
        let stream = file.open_stream(StreamName::Main, 0);
        let mut stream = stream.lock();
        for thread in self.recorded() {
            self.snapshots
                .load_stack(&mut stream, thread.id, thread.stack_end())?;
        }
        Ok(())
    }

    /// After the main thread restored its stack, wake every thread that
    /// still has to restore its own and wait until all have.
    pub fn wait_for_idle_threads_to_restore_their_stacks(&self) -> ExecResult<()> {
        let main = self.require_main("wait_for_idle_threads_to_restore_their_stacks")?;
        loop {
            let mut done = true;
            for thread in self.recorded_non_main() {
                if self.snapshots.should_restore(thread.id) {
                    thread.pipe.notify();
                    done = false;
                }
            }
            if done {
                return Ok(());
            }
            main.pipe.wait();
        }
    }
}

impl Rewindable for Threads {
    type Error = ExecError;

    fn save_state(&self, snapshot: SnapshotId) {
        let state = self
            .recorded()
            .map(|thread| SavedThread {
                pass_through: thread.pass_through.load(Ordering::Relaxed),
                disallow: thread.disallow.load(Ordering::Relaxed),
                wait_lock: thread.wait_lock.load(Ordering::SeqCst),
                wait_cvar: thread.wait_cvar.load(Ordering::SeqCst),
                wait_thread: thread.wait_thread.load(Ordering::SeqCst),
                routine: *thread.routine.lock(),
            })
            .collect();
        self.saved.lock().insert(snapshot, state);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> ExecResult<()> {
        let state = {
            let mut saved = self.saved.lock();
            saved.retain(|id, _| *id <= snapshot);
            saved.get(&snapshot).cloned()
        }
        .ok_or(ExecError::NoSavedState(snapshot))?;

        for (thread, saved) in self.recorded().zip(state) {
            thread.pass_through.store(saved.pass_through, Ordering::Relaxed);
            thread.disallow.store(saved.disallow, Ordering::Relaxed);
            thread.wait_lock.store(saved.wait_lock, Ordering::SeqCst);
            thread.wait_cvar.store(saved.wait_cvar, Ordering::SeqCst);
            thread.wait_thread.store(saved.wait_thread, Ordering::SeqCst);
            *thread.routine.lock() = saved.routine;
        }
        self.set_diverged(false);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// A leaked table with `recorded` recorded ids whose main thread is the
    /// calling test thread.
    pub(crate) fn threads(
        dir: &tempfile::TempDir,
        file: &str,
        recorded: usize,
        helpers: usize,
    ) -> &'static Threads {
        let path = dir.path().join(file);
        let stacks = dir.path().join(format!("{}-stack", file)).display().to_string();
        let file = if path.exists() {
            File::open(&path).unwrap()
        } else {
            File::create(&path).unwrap()
        };
        let config = ThreadConfig::new(stacks)
            .with_recorded_threads(recorded)
            .with_call_event_helpers(helpers);
        let threads: &'static Threads =
            Box::leak(Box::new(Threads::new(config, Arc::new(file)).unwrap()));
        threads.initialize().unwrap();
        threads
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never became true");
    }

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn bump(by: usize) {
        COUNTER.fetch_add(by as u64, Ordering::SeqCst);
    }

    #[test]
    fn started_threads_reuse_their_slots() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "start", 3, 0);
        assert!(threads.current_is_main());

        let first = threads.start_thread(bump, 5, true).unwrap();
        threads.join_thread(first).unwrap();
        let second = threads.start_thread(bump, 7, true).unwrap();
        assert_eq!(first, second);
        threads.join_thread(second).unwrap();
        assert!(matches!(threads.join_thread(second), Err(ExecError::NotJoinable(_))));
        assert!(COUNTER.load(Ordering::SeqCst) >= 12);
    }

    #[test]
    fn too_many_threads() {
        fn park(_: usize) {
            std::thread::park();
        }
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "many", 3, 0);
        threads.start_thread(park, 0, false).unwrap();
        threads.start_thread(park, 0, false).unwrap();
        assert!(matches!(
            threads.start_thread(park, 0, false),
            Err(ExecError::TooManyThreads)
        ));
    }

    #[test]
    fn idle_threads_are_collected_and_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "idle", 4, 0);
        threads.wait_for_idle_threads().unwrap();
        assert!(threads.are_idle());
        assert!(threads.recorded_non_main().all(Thread::is_idle));
        threads.resume_idle_threads().unwrap();
        wait_until(|| threads.recorded_non_main().all(Thread::is_idle));
        assert!(!threads.should_idle());
    }

    static RELEASED: AtomicBool = AtomicBool::new(false);
    static CALLBACKS: AtomicUsize = AtomicUsize::new(0);

    /// Blocks outside the lock model until its unrecorded wait callback runs.
    fn blocked_outside_locks(table: usize) {
        // SAFETY: the test passes a leaked `&'static Threads`
        let threads = unsafe { &*(table as *const Threads) };
        threads
            .notify_unrecorded_wait(|| {
                CALLBACKS.fetch_add(1, Ordering::SeqCst);
                RELEASED.store(true, Ordering::SeqCst);
            })
            .unwrap();
        while !RELEASED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        threads.maybe_wait_for_snapshot().unwrap();
    }

    #[test]
    fn unrecorded_wait_callback_lets_idling_finish() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "unrecorded", 3, 0);
        let table = threads as *const Threads as usize;
        let id = threads.start_thread(blocked_outside_locks, table, true).unwrap();
        wait_until(|| threads.slot(id).unrecorded_wait.lock().callback.is_some());

        threads.wait_for_idle_threads().unwrap();
        assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1);
        assert!(threads.slot(id).is_idle());
        threads.resume_idle_threads().unwrap();
        threads.join_thread(id).unwrap();
    }

    #[test]
    fn idling_and_events_need_the_main_thread() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "main", 2, 0);
        let other = std::thread::spawn(move || {
            (
                threads.wait_for_idle_threads().is_err(),
                threads.event_thread().unwrap().is_none(),
            )
        });
        assert_eq!(other.join().unwrap(), (true, true));

        let main = threads.main_thread();
        main.begin_disallow_events();
        assert!(matches!(threads.event_thread(), Err(ExecError::EventsDisallowed(1))));
        main.end_disallow_events();
        threads.set_diverged(true);
        assert!(matches!(threads.event_thread(), Err(ExecError::Diverged(1))));
        threads.set_diverged(false);
        main.begin_pass_through();
        assert!(threads.event_thread().unwrap().is_none());
        main.end_pass_through();
    }

    #[test]
    fn bookkeeping_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "rewind", 2, 0);
        let main = threads.main_thread();
        threads.save_state(0);
        main.begin_disallow_events();
        threads.set_diverged(true);
        threads.save_state(1);
        threads.restore_state(0).unwrap();
        assert!(!main.events_disallowed());
        assert!(!threads.has_diverged());
        assert!(matches!(threads.restore_state(1), Err(ExecError::NoSavedState(1))));
    }

    #[test]
    fn restored_threads_resume_with_their_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "restore", 3, 0);
        let main = threads.main_thread();
        main.begin_disallow_events();

        threads.wait_for_idle_threads().unwrap();
        if threads.save_all_threads(0).unwrap() {
            assert!(!main.pass_through());
            threads.resume_idle_threads().unwrap();
            main.end_disallow_events();
            main.begin_pass_through();
            threads.wait_for_idle_threads().unwrap();
            match threads.restore_all_threads(0).unwrap() {}
        }

        // Back in save_all_threads' caller with the depths of snapshot 0.
        threads.wait_for_idle_threads_to_restore_their_stacks().unwrap();
        assert!(!main.pass_through());
        assert!(main.events_disallowed());
        assert!(threads.recorded_non_main().all(Thread::is_idle));
        assert!(threads.recorded_non_main().all(|thread| thread.pass_through()));
        threads.resume_idle_threads().unwrap();
        main.end_disallow_events();
        assert!(threads.event_thread().unwrap().is_some());
    }

    #[test]
    fn recent_assertions_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "asserts", 1, 0);
        let main = threads.main_thread();
        for i in 0..RECENT_ASSERTS + 5 {
            main.note_assert(format!("assert {}", i));
        }
        let recent = main.recent_asserts();
        assert_eq!(recent.len(), RECENT_ASSERTS);
        assert_eq!(recent[0], "assert 5");
    }

    #[test]
    fn cvar_signal_wakes_one_waiter() {
        fn waiter(table: usize) {
            // SAFETY: the test passes a leaked `&'static Threads`
            let threads = unsafe { &*(table as *const Threads) };
            threads.wait_for_cvar(0x5000, || {}).unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "cvar", 3, 0);
        let table = threads as *const Threads as usize;
        let a = threads.start_thread(waiter, table, true).unwrap();
        let b = threads.start_thread(waiter, table, true).unwrap();
        wait_until(|| {
            threads.slot(a).wait_cvar.load(Ordering::SeqCst) == 0x5000
                && threads.slot(b).wait_cvar.load(Ordering::SeqCst) == 0x5000
        });

        threads.signal_cvar(0x5000, false);
        wait_until(|| {
            [a, b]
                .iter()
                .filter(|&&id| threads.slot(id).wait_cvar.load(Ordering::SeqCst) == 0)
                .count()
                == 1
        });
        threads.signal_cvar(0x5000, true);
        threads.join_thread(a).unwrap();
        threads.join_thread(b).unwrap();

        let notified = threads
            .wait_for_cvar_until(0x6000, || {}, || true)
            .unwrap();
        assert!(!notified);
    }
}
