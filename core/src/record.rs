//! Recorded values, recorded bytes and the recording itself.

use std::path::Path;

use rewind_execution::{record_or_replay_event, ExecError, ThreadEvent};
use rewindfs::FsError;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

impl Engine {
    // ========================================================================
    // Non-deterministic inputs
    // ========================================================================

    /// Record `value`, or return the value recorded in its place.
    pub fn record_replay_value(&self, value: u64) -> u64 {
        self.recover(self.try_record_replay_value(value))
    }

    fn try_record_replay_value(&self, mut value: u64) -> EngineResult<u64> {
        let Some(thread) = self.threads.event_thread()? else {
            return Ok(value);
        };
        self.asserts.assert("Value")?;
        let mut events = thread.events()?.lock();
        record_or_replay_event(&mut events, ThreadEvent::Value)?;
        events.record_or_replay_scalar(&mut value)?;
        Ok(value)
    }

    /// Record `data`, or overwrite it with the bytes recorded in its place.
    /// The length must match the recording.
    pub fn record_replay_bytes(&self, data: &mut [u8]) {
        self.recover(self.try_record_replay_bytes(data));
    }

    fn try_record_replay_bytes(&self, data: &mut [u8]) -> EngineResult<()> {
        let Some(thread) = self.threads.event_thread()? else {
            return Ok(());
        };
        self.asserts.assert(&format!("Bytes {}", data.len()))?;
        let mut events = thread.events()?.lock();
        record_or_replay_event(&mut events, ThreadEvent::Bytes)?;
        events.check_input(data.len() as u64)?;
        events.record_or_replay_bytes(data)?;
        Ok(())
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Mark the recording unusable. Only the first reason is kept. While
    /// replaying this is fatal.
    pub fn invalidate_recording(&self, why: &str) {
        if !self.file.is_recording() {
            self.recover::<(), _>(Err(EngineError::InvalidatedWhileReplaying(why.to_owned())));
            return;
        }
        let mut invalid = self.invalid.lock();
        if invalid.is_none() {
            log::warn!("recording invalidated: {}", why);
            *invalid = Some(why.to_owned());
        }
    }

    /// Why the recording was invalidated, if it was.
    pub fn invalidation(&self) -> Option<String> {
        self.invalid.lock().clone()
    }

    pub(crate) fn check_usable(&self) -> EngineResult<()> {
        match self.invalid.lock().as_ref() {
            Some(why) => Err(EngineError::Unusable(why.clone())),
            None => Ok(()),
        }
    }

    /// Write everything recorded so far, plus the weak pointer table, to
    /// `path`. Main thread only; the other threads idle meanwhile.
    pub fn save_recording(&self, path: &Path) -> EngineResult<()> {
        if !self.threads.current_is_main() {
            return Err(ExecError::NotMainThread("save_recording").into());
        }
        if !self.file.is_recording() {
            return Err(FsError::WrongMode { actual: "reading" }.into());
        }
        self.threads.wait_for_idle_threads()?;
        let saved = self.write_recording_copy(path);
        self.threads.resume_idle_threads()?;
        saved
    }

    fn write_recording_copy(&self, path: &Path) -> EngineResult<()> {
        self.check_usable()?;
        let copy = self.file.save_copy(path)?;
        self.weak_pointers.write_table(&copy)?;
        copy.close()?;
        log::info!("saved recording to {}", path.display());
        self.hooks.on_save_recording(path);
        Ok(())
    }

    /// Make everything recorded so far readable from the recording file.
    pub fn flush_recording(&self) -> EngineResult<()> {
        if !self.threads.current_is_main() {
            return Err(ExecError::NotMainThread("flush_recording").into());
        }
        self.threads.wait_for_idle_threads()?;
        let flushed = self.file.flush();
        self.threads.resume_idle_threads()?;
        Ok(flushed?)
    }
}
