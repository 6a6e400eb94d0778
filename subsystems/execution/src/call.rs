//! Off-thread call events.
//!
//! Some native calls must run on a thread other than the recorded one that
//! issues them. A pool of non-recorded helper threads runs such calls while
//! the recorded caller waits. A running call counts as an active call event;
//! the main thread does not consider the process idle until none are active,
//! unless the call itself declared that it is blocked
//! ([`Threads::start_off_thread_call_event`]).

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rewind_hal::SpinLock;

use crate::error::{ExecError, ExecResult};
use crate::thread::{ThreadId, Threads, MAIN_THREAD_ID};

type CallEvent = Box<dyn FnOnce() + Send>;

/// A helper thread's mailbox.
pub(crate) struct CallEventHelper {
    /// Slot of the helper thread, 0 until spawned
    thread: AtomicUsize,
    /// Recorded thread waiting for the call, 0 when the helper is free
    requestor: AtomicUsize,
    call: SpinLock<Option<CallEvent>>,
}

impl core::fmt::Debug for CallEventHelper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallEventHelper")
            .field("thread", &self.thread.load(Ordering::Relaxed))
            .field("requestor", &self.requestor.load(Ordering::Relaxed))
            .finish()
    }
}

impl CallEventHelper {
    pub(crate) fn new() -> Self {
        Self {
            thread: AtomicUsize::new(0),
            requestor: AtomicUsize::new(0),
            call: SpinLock::new(None),
        }
    }
}

impl Threads {
    pub(crate) fn spawn_call_event_helper(&'static self, index: usize) -> ExecResult<()> {
        let id = self.spawn_non_recorded(format!("rewind-call-{}", index), move |id| {
            self.run_call_events(index, id)
        })?;
        self.helpers[index].thread.store(id, Ordering::SeqCst);
        Ok(())
    }

    fn run_call_events(&self, index: usize, id: ThreadId) {
        let helper = &self.helpers[index];
        let Some(thread) = self.get(id) else {
            return;
        };
        loop {
            let call = helper.call.lock().take();
            let Some(call) = call else {
                thread.pipe.wait();
                continue;
            };
            call();
            let requestor = helper.requestor.swap(0, Ordering::SeqCst);
            self.release_call_event();
            self.notify(requestor);
        }
    }

    fn add_call_event(&self) {
        self.active_call_events.fetch_add(1, Ordering::SeqCst);
    }

    fn release_call_event(&self) {
        if self.active_call_events.fetch_sub(1, Ordering::SeqCst) == 1 && self.should_idle() {
            self.notify(MAIN_THREAD_ID);
        }
    }

    /// Run `call` on a helper thread and wait, idling if asked to, until
    /// `completed` is set. The call sets `completed` when it is done.
    pub fn execute_call_event_off_thread(
        &self,
        call: impl FnOnce() + Send + 'static,
        completed: &AtomicBool,
    ) -> ExecResult<()> {
        let thread = self
            .current()
            .filter(|t| t.is_recorded())
            .ok_or(ExecError::NotRecorded("execute_call_event_off_thread"))?;
        if !self.file().is_recording() || self.are_idle() {
            return Err(ExecError::NotRecorded("execute_call_event_off_thread"));
        }

        self.add_call_event();
        let Some(helper) = self.helpers.iter().find(|helper| {
            helper
                .requestor
                .compare_exchange(0, thread.id(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }) else {
            self.release_call_event();
            return Err(ExecError::NoCallEventHelper);
        };
        *helper.call.lock() = Some(Box::new(call));
        self.notify(helper.thread.load(Ordering::SeqCst));

        while !completed.load(Ordering::SeqCst) {
            self.wait_on(thread)?;
            if !self.file().is_recording() {
                break;
            }
        }
        Ok(())
    }

    /// Called by an off-thread call that is about to block: the process may
    /// idle while it is blocked.
    pub fn start_off_thread_call_event(&self) -> ExecResult<()> {
        if !self.file().is_recording() || self.are_idle() {
            return Err(ExecError::NotRecorded("start_off_thread_call_event"));
        }
        self.release_call_event();
        Ok(())
    }

    /// Called by an off-thread call once it is no longer blocked. Waits out
    /// any snapshot or rewind in progress. A call that outlives the
    /// recording never returns.
    pub fn end_off_thread_call_event(&self) -> ExecResult<()> {
        let thread = self
            .current()
            .ok_or(ExecError::NotRecorded("end_off_thread_call_event"))?;
        loop {
            while self.should_idle() {
                thread.pipe.wait();
            }
            self.add_call_event();
            if !self.should_idle() {
                break;
            }
            self.release_call_event();
        }
        if !self.file().is_recording() {
            self.release_call_event();
            rewind_hal::fatal::park_forever();
        }
        Ok(())
    }

    /// Active off-thread call events.
    pub fn active_call_events(&self) -> usize {
        self.active_call_events.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::thread::tests::threads;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn call_runs_on_a_helper_thread() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "call", 2, 2);
        static COMPLETED: AtomicBool = AtomicBool::new(false);
        let ran_on = Arc::new(AtomicUsize::new(0));
        let seen = ran_on.clone();
        threads
            .execute_call_event_off_thread(
                move || {
                    seen.store(threads.current_id().unwrap_or(0), Ordering::SeqCst);
                    COMPLETED.store(true, Ordering::SeqCst);
                },
                &COMPLETED,
            )
            .unwrap();
        assert!(ran_on.load(Ordering::SeqCst) > 2);
        for _ in 0..1000 {
            if threads.active_call_events() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(threads.active_call_events(), 0);
    }

    #[test]
    fn blocked_calls_do_not_hold_up_idling() {
        let dir = tempfile::tempdir().unwrap();
        let threads = threads(&dir, "blocked", 3, 1);
        static RELEASE: AtomicBool = AtomicBool::new(false);
        static COMPLETED: AtomicBool = AtomicBool::new(false);
        static BLOCKED: AtomicBool = AtomicBool::new(false);

        fn caller(table: usize) {
            // SAFETY: the test passes a leaked `&'static Threads`
            let threads: &'static crate::Threads = unsafe { &*(table as *const crate::Threads) };
            threads
                .execute_call_event_off_thread(
                    move || {
                        threads.start_off_thread_call_event().unwrap();
                        BLOCKED.store(true, Ordering::SeqCst);
                        while !RELEASE.load(Ordering::SeqCst) {
                            std::thread::sleep(std::time::Duration::from_millis(1));
                        }
                        threads.end_off_thread_call_event().unwrap();
                        COMPLETED.store(true, Ordering::SeqCst);
                    },
                    &COMPLETED,
                )
                .unwrap();
        }

        let table = threads as *const crate::Threads as usize;
        let id = threads.start_thread(caller, table, true).unwrap();
        while !BLOCKED.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        threads.wait_for_idle_threads().unwrap();
        assert_eq!(threads.active_call_events(), 0);
        threads.resume_idle_threads().unwrap();
        RELEASE.store(true, Ordering::SeqCst);
        threads.join_thread(id).unwrap();
        assert!(COMPLETED.load(Ordering::SeqCst));
    }
}
