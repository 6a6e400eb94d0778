//! Recorded locks.
//!
//! Every native lock the process registers gets a [`RecordedLock`] keyed by
//! the native lock's address. Locks created by recorded threads also get a
//! nonzero [`LockId`] and an acquires stream: while recording, each outermost
//! acquisition appends the acquiring thread's id; while replaying, a thread
//! may only acquire once the recording names it as the next owner.
//!
//! ```text
//!   recording                         replaying
//!   ─────────                         ─────────
//!   take flag                         wait until next_owner == me
//!   append me to Lock/<id>            take flag
//!   ...                               ...
//!   release flag                      next_owner = read Lock/<id>
//!                                     notify next_owner, release flag
//! ```
//!
//! A lock with id 0 is unrecorded: it still excludes other threads but its
//! order is free.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use rewind_hal::{Rewindable, RwSpinLock, SnapshotId, SpinLock};
use rewindfs::{File, FsError, StreamHandle, StreamName};

use crate::error::{ExecError, ExecResult};
use crate::event::{record_or_replay_event, ThreadEvent};
use crate::thread::{Thread, ThreadId, Threads};

/// Identifier of a recorded lock, stable across executions.
pub type LockId = usize;

/// Id of locks whose acquisition order is not recorded.
pub const UNRECORDED_LOCK_ID: LockId = 0;

/// Id of the lock ordering accesses to recorded atomics.
pub const ATOMIC_LOCK_ID: LockId = 1;

const FIRST_LOCK_ID: LockId = 2;

/// `next_owner` when the recording has no further acquisitions.
const NO_NEXT_OWNER: usize = 0;

/// Time a suspected hopeless wait is left to resolve itself.
const CONFIRM_DELAY: Duration = Duration::from_millis(20);

/// Replay turn waits wake up this often to look for hopeless waits.
const TURN_POLL: Duration = Duration::from_millis(50);

/// Native key of the atomic access lock.
static ATOMIC_LOCK_KEY: u8 = 0;

fn atomic_lock_key() -> usize {
    core::ptr::addr_of!(ATOMIC_LOCK_KEY) as usize
}

/// A registered lock.
#[derive(Debug)]
pub struct RecordedLock {
    id: LockId,
    native: usize,
    owner: AtomicUsize,
    depth: AtomicUsize,
    /// Acquisitions so far, checked against the recording
    acquired: AtomicU64,
    next_owner: AtomicUsize,
    stream: Option<StreamHandle>,
}

impl RecordedLock {
    fn new(id: LockId, native: usize, file: &File) -> Self {
        Self {
            id,
            native,
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            next_owner: AtomicUsize::new(NO_NEXT_OWNER),
            stream: (id != UNRECORDED_LOCK_ID).then(|| file.open_stream(StreamName::Lock, id)),
        }
    }

    /// Recorded id, 0 when unrecorded.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Thread holding the lock, 0 when free.
    pub fn owner(&self) -> ThreadId {
        self.owner.load(Ordering::SeqCst)
    }

    fn stream(&self) -> ExecResult<&StreamHandle> {
        self.stream.as_ref().ok_or(ExecError::UnknownLock(self.native))
    }

    /// Read the next recorded owner. The end of the stream is not an error
    /// until somebody waits for that acquisition.
    fn read_next_owner(&self) -> ExecResult<()> {
        let next = match self.stream()?.lock().read_scalar() {
            Ok(owner) => owner as usize,
            Err(FsError::EndOfStream { .. }) => NO_NEXT_OWNER,
            Err(err) => return Err(err.into()),
        };
        self.next_owner.store(next, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct SavedLock {
    lock: Arc<RecordedLock>,
    owner: usize,
    depth: usize,
    acquired: u64,
    next_owner: usize,
}

#[derive(Debug)]
struct SavedLocks {
    locks: Vec<(usize, SavedLock)>,
    next_id: LockId,
    was_recording: bool,
}

/// Table of every registered lock.
#[derive(Debug)]
pub struct Locks {
    threads: &'static Threads,
    file: Arc<File>,
    by_native: RwSpinLock<HashMap<usize, Arc<RecordedLock>>>,
    next_id: AtomicUsize,
    saved: SpinLock<BTreeMap<SnapshotId, SavedLocks>>,
}

impl Locks {
    /// Empty table with the atomic access lock registered.
    pub fn new(threads: &'static Threads) -> ExecResult<Self> {
        let file = threads.file().clone();
        let atomic = Arc::new(RecordedLock::new(ATOMIC_LOCK_ID, atomic_lock_key(), &file));
        if !file.is_recording() {
            atomic.read_next_owner()?;
        }
        let mut by_native = HashMap::new();
        by_native.insert(atomic_lock_key(), atomic);
        Ok(Self {
            threads,
            file,
            by_native: RwSpinLock::new(by_native),
            next_id: AtomicUsize::new(FIRST_LOCK_ID),
            saved: SpinLock::new(BTreeMap::new()),
        })
    }

    /// The registered lock for `native`.
    pub fn find(&self, native: usize) -> Option<Arc<RecordedLock>> {
        self.by_native.read().get(&native).cloned()
    }

    /// Registered locks.
    pub fn len(&self) -> usize {
        self.by_native.read().len()
    }

    /// Whether only the atomic access lock is registered.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// The calling thread if its lock operations are ordered.
    fn ordering_thread(&self) -> Option<&Thread> {
        let thread = self.threads.current()?;
        let ordered = !thread.pass_through()
            && !thread.events_disallowed()
            && !self.threads.has_diverged();
        ordered.then_some(thread)
    }

    fn bound_thread(&self, operation: &'static str) -> ExecResult<&Thread> {
        self.threads.current().ok_or(ExecError::NotRecorded(operation))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register the native lock at `native`. A recorded thread creates a
    /// recorded lock and the id it received is replayed; any other caller
    /// creates an unrecorded one.
    pub fn new_lock(&self, native: usize) -> ExecResult<LockId> {
        let id = match self.ordering_thread() {
            Some(thread) => {
                let mut id = 0u64;
                if self.file.is_recording() {
                    id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
                }
                let mut events = thread.events()?.lock();
                record_or_replay_event(&mut events, ThreadEvent::CreateLock)?;
                events.record_or_replay_scalar(&mut id)?;
                let id = id as LockId;
                if id < FIRST_LOCK_ID {
                    return Err(FsError::Corrupt(format!("recorded lock id {}", id)).into());
                }
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => UNRECORDED_LOCK_ID,
        };

        let lock = Arc::new(RecordedLock::new(id, native, &self.file));
        if id != UNRECORDED_LOCK_ID && !self.file.is_recording() {
            lock.read_next_owner()?;
        }
        log::trace!("lock {:#x} registered as {}", native, id);
        self.by_native.write().insert(native, lock);
        Ok(id)
    }

    /// Forget the lock at `native`.
    pub fn destroy(&self, native: usize) {
        self.by_native.write().remove(&native);
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Acquire the lock at `native` in its recorded order.
    pub fn enter(&self, native: usize) -> ExecResult<()> {
        let lock = self.find(native).ok_or(ExecError::UnknownLock(native))?;
        let thread = self.bound_thread("enter")?;

        let ordered = lock.id != UNRECORDED_LOCK_ID && self.ordering_thread().is_some();
        if !ordered {
            return self.take(&lock, thread);
        }

        record_or_replay_event(&mut thread.events()?.lock(), ThreadEvent::Lock)?;
        thread.events()?.lock().check_input(lock.id as u64)?;

        if lock.owner() == thread.id() {
            lock.depth.fetch_add(1, Ordering::SeqCst);
        } else if self.file.is_recording() {
            self.take(&lock, thread)?;
            lock.stream()?.lock().write_scalar(thread.id() as u64)?;
        } else {
            self.wait_for_turn(&lock, thread)?;
            self.take(&lock, thread)?;
        }

        let ordinal = lock.acquired.fetch_add(1, Ordering::SeqCst);
        thread.events()?.lock().check_input(ordinal)?;
        Ok(())
    }

    /// Try to acquire the lock at `native` without blocking on other
    /// owners. The outcome is recorded.
    pub fn try_enter(&self, native: usize) -> ExecResult<bool> {
        let lock = self.find(native).ok_or(ExecError::UnknownLock(native))?;
        let thread = self.bound_thread("try_enter")?;

        let ordered = lock.id != UNRECORDED_LOCK_ID && self.ordering_thread().is_some();
        if !ordered {
            return Ok(self.try_take(&lock, thread));
        }

        {
            let mut events = thread.events()?.lock();
            record_or_replay_event(&mut events, ThreadEvent::TryLock)?;
            events.check_input(lock.id as u64)?;
        }

        let reentrant = lock.owner() == thread.id();
        let mut acquired = 0u64;
        if self.file.is_recording() {
            acquired = u64::from(self.try_take(&lock, thread));
            if acquired != 0 && !reentrant {
                lock.stream()?.lock().write_scalar(thread.id() as u64)?;
            }
        }
        thread.events()?.lock().record_or_replay_scalar(&mut acquired)?;
        if acquired == 0 {
            return Ok(false);
        }

        if !self.file.is_recording() {
            if reentrant {
                lock.depth.fetch_add(1, Ordering::SeqCst);
            } else {
                self.wait_for_turn(&lock, thread)?;
                self.take(&lock, thread)?;
            }
        }

        let ordinal = lock.acquired.fetch_add(1, Ordering::SeqCst);
        thread.events()?.lock().check_input(ordinal)?;
        Ok(true)
    }

    /// Release the lock at `native`.
    pub fn leave(&self, native: usize) -> ExecResult<()> {
        let lock = self.find(native).ok_or(ExecError::UnknownLock(native))?;
        let thread = self.bound_thread("leave")?;
        if lock.owner() != thread.id() {
            return Err(ExecError::NotOwner {
                lock: lock.id,
                thread: thread.id(),
            });
        }

        if lock.depth.fetch_sub(1, Ordering::SeqCst) > 1 {
            return Ok(());
        }

        let ordered = lock.id != UNRECORDED_LOCK_ID && self.ordering_thread().is_some();
        if ordered && !self.file.is_recording() {
            lock.read_next_owner()?;
            let next = lock.next_owner.load(Ordering::SeqCst);
            if next != NO_NEXT_OWNER {
                self.threads.notify(next);
            }
        }

        lock.owner.store(0, Ordering::SeqCst);
        for waiter in self.threads.recorded().chain(self.non_recorded()) {
            if waiter.wait_lock.load(Ordering::SeqCst) == native {
                waiter.pipe.notify();
            }
        }
        Ok(())
    }

    fn non_recorded(&self) -> impl Iterator<Item = &Thread> + '_ {
        let first = self.threads.config().max_recorded_thread_id + 1;
        (first..).map_while(|id| self.threads.get(id))
    }

    /// Order a recorded atomic access against all others.
    pub fn begin_ordered_atomic_access(&self) -> ExecResult<()> {
        self.enter(atomic_lock_key())
    }

    /// End an ordered atomic access.
    pub fn end_ordered_atomic_access(&self) -> ExecResult<()> {
        self.leave(atomic_lock_key())
    }

    fn try_take(&self, lock: &RecordedLock, thread: &Thread) -> bool {
        let me = thread.id();
        if lock.owner() == me {
            lock.depth.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        if lock
            .owner
            .compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            lock.depth.store(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Take the exclusion flag, waiting while another thread holds it.
    fn take(&self, lock: &RecordedLock, thread: &Thread) -> ExecResult<()> {
        loop {
            // Advertise the wait before trying, so a release in between still
            // notifies this thread.
            thread.wait_lock.store(lock.native, Ordering::SeqCst);
            if self.try_take(lock, thread) {
                thread.wait_lock.store(0, Ordering::SeqCst);
                return Ok(());
            }
            if let Err(err) = self.threads.wait_on(thread) {
                thread.wait_lock.store(0, Ordering::SeqCst);
                return Err(err);
            }
        }
    }

    // ========================================================================
    // Replay order
    // ========================================================================

    fn wait_for_turn(&self, lock: &RecordedLock, thread: &Thread) -> ExecResult<()> {
        let result = self.wait_for_turn_inner(lock, thread);
        thread.wait_lock.store(0, Ordering::SeqCst);
        result
    }

    fn wait_for_turn_inner(&self, lock: &RecordedLock, thread: &Thread) -> ExecResult<()> {
        let mut suspect: Option<&'static str> = None;
        loop {
            thread.wait_lock.store(lock.native, Ordering::SeqCst);
            let next = lock.next_owner.load(Ordering::SeqCst);
            if next == thread.id() {
                return Ok(());
            }
            if next == NO_NEXT_OWNER {
                return Err(ExecError::EndOfLockStream {
                    lock: lock.id,
                    thread: thread.id(),
                });
            }

            let hopeless = self.diagnose(thread, next);
            if let (Some(reason), Some(previous)) = (hopeless, suspect) {
                if reason == previous {
                    log::error!(
                        "lock {} waits for thread {} forever: {}",
                        lock.id,
                        next,
                        reason
                    );
                    return Err(ExecError::LockOrder {
                        lock: lock.id,
                        thread: thread.id(),
                        next_owner: next as u64,
                        reason,
                    });
                }
            }
            suspect = hopeless;

            if suspect.is_some() {
                std::thread::sleep(CONFIRM_DELAY);
            } else if self.threads.should_idle() || thread.pass_through() {
                self.threads.wait_on(thread)?;
            } else {
                thread.pipe.wait_timeout(TURN_POLL);
            }
        }
    }

    /// The thread `thread` waits on, if any.
    fn blocked_on(&self, thread: &Thread) -> Option<ThreadId> {
        let native = thread.wait_lock.load(Ordering::SeqCst);
        if native != 0 {
            let lock = self.find(native)?;
            let owner = lock.owner();
            if owner != 0 && owner != thread.id() {
                return Some(owner);
            }
            let next = lock.next_owner.load(Ordering::SeqCst);
            return (next != thread.id() && next != NO_NEXT_OWNER).then_some(next);
        }
        self.threads.joining(thread)
    }

    /// Why waiting for `next` can never end, if it cannot.
    fn diagnose(&self, thread: &Thread, next: ThreadId) -> Option<&'static str> {
        let Some(owner) = self.threads.get(next).filter(|t| t.is_recorded()) else {
            return Some("is waiting for a thread id outside the recorded range");
        };

        let mut current = owner;
        for _ in 0..self.threads.config().max_recorded_thread_id {
            let Some(waits_for) = self.blocked_on(current) else {
                break;
            };
            if waits_for == thread.id() {
                return Some("is part of a lock order cycle");
            }
            match self.threads.get(waits_for) {
                Some(t) => current = t,
                None => break,
            }
        }

        if !owner.is_running() {
            let everyone_blocked = self
                .threads
                .recorded()
                .filter(|t| t.is_running())
                .all(|t| self.blocked_on(t).is_some());
            if everyone_blocked {
                return Some("is waiting for a thread that is not running");
            }
        }
        None
    }
}

impl Rewindable for Locks {
    type Error = ExecError;

    fn save_state(&self, snapshot: SnapshotId) {
        let locks = self
            .by_native
            .read()
            .iter()
            .map(|(native, lock)| {
                (
                    *native,
                    SavedLock {
                        lock: lock.clone(),
                        owner: lock.owner(),
                        depth: lock.depth.load(Ordering::SeqCst),
                        acquired: lock.acquired.load(Ordering::SeqCst),
                        next_owner: lock.next_owner.load(Ordering::SeqCst),
                    },
                )
            })
            .collect();
        self.saved.lock().insert(
            snapshot,
            SavedLocks {
                locks,
                next_id: self.next_id.load(Ordering::SeqCst),
                was_recording: self.file.is_recording(),
            },
        );
    }

    /// Stream positions must already be back at `snapshot`.
    fn restore_state(&self, snapshot: SnapshotId) -> ExecResult<()> {
        let mut saved = self.saved.lock();
        saved.retain(|id, _| *id <= snapshot);
        let state = saved.get(&snapshot).ok_or(ExecError::NoSavedState(snapshot))?;

        let now_replaying = state.was_recording && !self.file.is_recording();
        let mut by_native = HashMap::with_capacity(state.locks.len());
        for (native, saved) in &state.locks {
            let lock = &saved.lock;
            lock.owner.store(saved.owner, Ordering::SeqCst);
            lock.depth.store(saved.depth, Ordering::SeqCst);
            lock.acquired.store(saved.acquired, Ordering::SeqCst);
            lock.next_owner.store(saved.next_owner, Ordering::SeqCst);
            if now_replaying && lock.id != UNRECORDED_LOCK_ID {
                // The held acquisition is the last one written; the release
                // reads the one after it.
                if saved.owner != 0 {
                    lock.next_owner.store(saved.owner, Ordering::SeqCst);
                } else {
                    lock.read_next_owner()?;
                }
            }
            by_native.insert(*native, lock.clone());
        }
        self.next_id.store(state.next_id, Ordering::SeqCst);
        *self.by_native.write() = by_native;

        log::trace!("locks restored to snapshot {}", snapshot);
        Ok(())
    }
}
