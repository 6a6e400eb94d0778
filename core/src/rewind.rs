//! # Snapshots and Rewinding
//!
//! Snapshot ids grow by one per [`Engine::take_snapshot`]. Only some
//! snapshots are recorded: the first, final and temporary ones, and
//! otherwise at most one per snapshot interval. A recorded snapshot saves
//! tracked memory (as a diff against the previous recorded one), every
//! table's bookkeeping, and every recorded thread's stack.
//!
//! Rewinding to a target restores the last recorded snapshot at or before
//! it; execution then runs forward again, passing the snapshots in between
//! as interim stops:
//!
//! ```text
//!   recorded:   0 ─────── 3 ─────── 5 ── live
//!   rewind(4):  live ─▶ 5 (restore_to_active)
//!                       5 ─▶ 3 (restore_to_last_diff(5))
//!               threads resume in take_snapshot(3), then run to 4
//! ```
//!
//! Nothing owning heap memory or holding a spin lock may be alive in the
//! frames around thread capture and restore: a restored stack still refers
//! to whatever its frames held at capture time.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rewind_execution::{ExecError, MAIN_THREAD_ID};
use rewind_hal::{Rewindable, SnapshotId, SpinLock};

use crate::engine::Engine;
use crate::error::{Disposition, EngineError, EngineResult};
use crate::{set_engine_state, EngineState};

/// Work queued for the main thread.
pub type MainThreadCallback = Box<dyn FnOnce() + Send>;

/// Snapshot bookkeeping. Lives outside tracked memory and survives rewinds.
pub(crate) struct RewindState {
    last_snapshot: SpinLock<Option<SnapshotId>>,
    recorded: SpinLock<Vec<SnapshotId>>,
    last_recorded_at: SpinLock<Option<Instant>>,
    rewind_target: SpinLock<Option<SnapshotId>>,
    unhandled_divergence_allowed: AtomicBool,
    callbacks: SpinLock<VecDeque<MainThreadCallback>>,
    should_pause: AtomicBool,
}

impl RewindState {
    pub(crate) fn new() -> Self {
        Self {
            last_snapshot: SpinLock::new(None),
            recorded: SpinLock::new(Vec::new()),
            last_recorded_at: SpinLock::new(None),
            rewind_target: SpinLock::new(None),
            unhandled_divergence_allowed: AtomicBool::new(false),
            callbacks: SpinLock::new(VecDeque::new()),
            should_pause: AtomicBool::new(false),
        }
    }

    fn next_snapshot(&self) -> SnapshotId {
        self.last_snapshot.lock().map_or(0, |last| last + 1)
    }

    /// Whether snapshot `id` is saved.
    fn should_record(&self, id: SnapshotId, is_final: bool, temporary: bool, interval: Duration) -> bool {
        let mut last_recorded_at = self.last_recorded_at.lock();
        let due = match *last_recorded_at {
            None => true,
            Some(at) => at.elapsed() >= interval,
        };
        if id == 0 || is_final || temporary || due {
            *last_recorded_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Whether `id` is a stop on the way to a farther rewind target. The
    /// target is dropped once reached.
    fn is_interim(&self, id: SnapshotId) -> bool {
        let mut target = self.rewind_target.lock();
        match *target {
            Some(target_id) if id < target_id => true,
            Some(_) => {
                *target = None;
                false
            }
            None => false,
        }
    }
}

/// Which recovery a rewind performs.
#[derive(Debug, Clone, Copy)]
enum Recovery {
    EndOfRecording,
    Divergence,
}

impl Engine {
    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Id of the latest snapshot taken.
    pub fn last_snapshot(&self) -> Option<SnapshotId> {
        *self.rewind.last_snapshot.lock()
    }

    /// Id of the latest recorded snapshot.
    pub fn last_recorded_snapshot(&self) -> Option<SnapshotId> {
        self.rewind.recorded.lock().last().copied()
    }

    /// Take a snapshot on the main thread. Returns true going forward, and
    /// false when a rewind restores this snapshot and execution resumes
    /// here.
    pub fn take_snapshot(&self, is_final: bool, temporary: bool) -> bool {
        self.recover(self.try_take_snapshot(is_final, temporary))
    }

    /// Start a checkpoint the controller can later rewind to.
    pub fn new_checkpoint(&self, temporary: bool) -> bool {
        self.take_snapshot(false, temporary)
    }

    #[inline(never)]
    fn try_take_snapshot(&self, is_final: bool, temporary: bool) -> EngineResult<bool> {
        if !self.threads.current_is_main() {
            return Err(ExecError::NotMainThread("take_snapshot").into());
        }
        self.hooks.before_snapshot();

        let id = self.rewind.next_snapshot();
        let mut forward = true;
        if self
            .rewind
            .should_record(id, is_final, temporary, self.config.snapshot_interval)
        {
            forward = self.record_snapshot(id)?;
        }
        if !forward {
            set_engine_state(EngineState::Running);
        }

        *self.rewind.last_snapshot.lock() = Some(id);
        let interim = self.rewind.is_interim(id);
        log::debug!(
            "snapshot {}{}{}",
            id,
            if is_final { " (final)" } else { "" },
            if interim { " (interim)" } else { "" }
        );

        let main = self.threads.main_thread();
        main.begin_disallow_events();
        self.hooks.after_snapshot(id, is_final, interim);
        main.end_disallow_events();
        Ok(forward)
    }

    #[inline(never)]
    fn record_snapshot(&self, id: SnapshotId) -> EngineResult<bool> {
        self.threads.wait_for_idle_threads()?;
        if self.memory.has_taken_snapshot() {
            self.memory.take_diff(id)?;
        } else {
            self.memory.take_first()?;
        }
        self.rewind.recorded.lock().push(id);
        self.save_tables(id);

        let forward = self.threads.save_all_threads(id)?;
        if !forward {
            self.threads.wait_for_idle_threads_to_restore_their_stacks()?;
            self.weak_pointers.run_pending_fixups(MAIN_THREAD_ID);
            log::info!("resumed at snapshot {}", id);
        }
        self.threads.resume_idle_threads()?;
        Ok(forward)
    }

    fn save_tables(&self, id: SnapshotId) {
        self.file.save_state(id);
        self.locks.save_state(id);
        self.memory.save_state(id);
        self.things.save_state(id);
        self.callbacks.save_state(id);
        self.triggers.save_state(id);
        self.weak_pointers.save_state(id);
    }

    fn restore_tables(&self, id: SnapshotId) -> EngineResult<()> {
        self.file.restore_state(id)?;
        self.locks.restore_state(id)?;
        self.memory.restore_state(id)?;
        self.things.restore_state(id)?;
        self.callbacks.restore_state(id)?;
        self.triggers.restore_state(id)?;
        self.weak_pointers.restore_state(id)?;
        Ok(())
    }

    // ========================================================================
    // Rewinding
    // ========================================================================

    /// Rewind every thread to the last recorded snapshot at or before
    /// `target` and resume there. Main thread only.
    pub fn restore_snapshot_and_resume(&self, target: SnapshotId) -> ! {
        match self.rewind_to(target) {
            Ok(never) => match never {},
            Err(err) => rewind_hal::fatal!("{}", err),
        }
    }

    #[inline(never)]
    fn rewind_to(&self, target: SnapshotId) -> EngineResult<Infallible> {
        if !self.threads.current_is_main() {
            return Err(ExecError::NotMainThread("restore_snapshot_and_resume").into());
        }
        let pending = self.rewind.callbacks.lock().len();
        if pending != 0 {
            return Err(EngineError::PendingCallbacks(pending));
        }
        let last = self.last_snapshot();
        if last.map_or(true, |last| target > last) {
            return Err(EngineError::BadSnapshot { target, last });
        }
        let restored = self
            .rewind
            .recorded
            .lock()
            .iter()
            .rev()
            .copied()
            .find(|id| *id <= target)
            .ok_or(EngineError::NoRecordedSnapshot)?;

        set_engine_state(EngineState::Rewinding);
        self.threads.wait_for_idle_threads()?;
        if self.file.is_recording() {
            self.prepare_first_rewind()?;
        }

        self.memory.restore_to_active()?;
        loop {
            let newer = {
                let mut recorded = self.rewind.recorded.lock();
                match recorded.last().copied() {
                    Some(id) if id > restored => recorded.pop(),
                    _ => None,
                }
            };
            match newer {
                Some(id) => self.memory.restore_to_last_diff(id)?,
                None => break,
            }
        }

        *self.rewind.last_snapshot.lock() = Some(restored);
        *self.rewind.rewind_target.lock() = Some(target);
        self.restore_tables(restored)?;
        log::info!("rewinding to snapshot {} (target {})", restored, target);
        Ok(self.threads.restore_all_threads(restored)?)
    }

    /// The recording ends here: keep what was recorded and replay from now
    /// on.
    fn prepare_first_rewind(&self) -> EngineResult<()> {
        self.check_usable()?;
        self.weak_pointers.write_table(&self.file)?;
        self.file.flush()?;
        self.hooks.on_save_recording(self.file.path());
        log::info!("switching {} to replay", self.file.path().display());
        Ok(())
    }

    // ========================================================================
    // Divergence
    // ========================================================================

    /// Let execution leave the recording. The next recorded event rewinds
    /// to the last snapshot.
    pub fn diverge_from_recording(&self) -> EngineResult<()> {
        if !self.threads.current_is_main() {
            return Err(ExecError::NotMainThread("diverge_from_recording").into());
        }
        self.rewind
            .unhandled_divergence_allowed
            .store(true, Ordering::SeqCst);
        self.threads.set_diverged(true);
        log::debug!("diverged from the recording");
        Ok(())
    }

    /// Make a recorded event after diverging fatal instead of rewinding.
    pub fn disallow_unhandled_divergence(&self) {
        self.rewind
            .unhandled_divergence_allowed
            .store(false, Ordering::SeqCst);
    }

    /// Whether execution has left the recording.
    pub fn has_diverged(&self) -> bool {
        self.threads.has_diverged()
    }

    // ========================================================================
    // Main thread callbacks
    // ========================================================================

    /// Queue `callback` for the main thread and pause it.
    pub fn pause_main_thread_and_invoke_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.rewind.callbacks.lock().push_back(Box::new(callback));
        self.rewind.should_pause.store(true, Ordering::SeqCst);
        if self.threads.current_is_main() {
            self.pause_main_thread_and_service_callbacks();
        } else {
            self.threads.notify(MAIN_THREAD_ID);
        }
    }

    /// Run queued callbacks in order until execution is resumed. Main
    /// thread only; recorded events are disallowed meanwhile.
    pub fn pause_main_thread_and_service_callbacks(&self) {
        if !self.threads.current_is_main() {
            return;
        }
        let main = self.threads.main_thread();
        main.begin_disallow_events();
        while self.rewind.should_pause.load(Ordering::SeqCst) {
            let next = self.rewind.callbacks.lock().pop_front();
            match next {
                Some(callback) => callback(),
                None => self.recover(self.threads.wait_no_idle()),
            }
        }
        main.end_disallow_events();
    }

    /// Let a paused main thread continue.
    pub fn resume_execution(&self) {
        self.rewind.should_pause.store(false, Ordering::SeqCst);
        self.threads.notify(MAIN_THREAD_ID);
    }

    /// Whether the main thread was asked to pause.
    pub fn main_thread_should_pause(&self) -> bool {
        self.rewind.should_pause.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Unwrap `result`, handling an error the way [`handle_error`](Self::handle_error) does.
    pub fn recover<T, E: Into<EngineError>>(&self, result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => self.handle_error(err.into()),
        }
    }

    /// Rewind out of a recoverable error, or report a fatal one.
    pub fn handle_error(&self, err: EngineError) -> ! {
        let recovery = match (&err, err.disposition()) {
            (_, Disposition::Fatal) => rewind_hal::fatal!("{}", err),
            (EngineError::Exec(ExecError::Diverged(_)), _) => Recovery::Divergence,
            _ => Recovery::EndOfRecording,
        };
        log::info!("recovering by rewinding: {}", err);
        drop(err);

        if self.threads.current_is_main() {
            self.recover_on_main(recovery);
        }
        self.pause_main_thread_and_invoke_callback(move || match crate::engine() {
            Some(engine) => engine.recover_on_main(recovery),
            None => rewind_hal::fatal!("{}", EngineError::NotInitialized),
        });
        match self.threads.wait_forever() {
            Ok(never) => match never {},
            Err(err) => rewind_hal::fatal!("{}", err),
        }
    }

    fn recover_on_main(&self, recovery: Recovery) -> ! {
        match recovery {
            Recovery::Divergence => {
                if !self
                    .rewind
                    .unhandled_divergence_allowed
                    .load(Ordering::SeqCst)
                {
                    rewind_hal::fatal!("{}", EngineError::UnhandledDivergence);
                }
                match self.last_snapshot() {
                    Some(target) => self.restore_snapshot_and_resume(target),
                    None => rewind_hal::fatal!("{}", EngineError::NoRecordedSnapshot),
                }
            }
            Recovery::EndOfRecording => {
                self.hooks.on_end_of_recording();
                match self.last_recorded_snapshot() {
                    Some(target) => self.restore_snapshot_and_resume(target),
                    None => rewind_hal::fatal!("{}", EngineError::NoRecordedSnapshot),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_final_and_temporary_snapshots_are_always_recorded() {
        let state = RewindState::new();
        let hour = Duration::from_secs(3600);
        assert!(state.should_record(0, false, false, hour));
        assert!(!state.should_record(1, false, false, hour));
        assert!(state.should_record(2, false, true, hour));
        assert!(state.should_record(3, true, false, hour));
        assert!(!state.should_record(4, false, false, hour));
        assert!(state.should_record(5, false, false, Duration::ZERO));
    }

    #[test]
    fn interim_stops_until_the_target() {
        let state = RewindState::new();
        *state.rewind_target.lock() = Some(4);
        assert!(state.is_interim(3));
        assert!(!state.is_interim(4));
        assert!(!state.is_interim(5));
    }

    #[test]
    fn snapshot_ids_grow_by_one() {
        let state = RewindState::new();
        assert_eq!(state.next_snapshot(), 0);
        *state.last_snapshot.lock() = Some(6);
        assert_eq!(state.next_snapshot(), 7);
    }
}
