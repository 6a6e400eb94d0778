//! Thread snapshots.
//!
//! A thread's state at a snapshot is its captured register context plus the
//! stack from the captured stack pointer up to the thread's stack end. The
//! part between the capture point and the caller's separator local changes
//! right after the capture, so it is copied at capture time (the stack top).
//! Everything above the separator is frozen while the thread is idle and is
//! read straight off the stack when the snapshot is written.
//!
//! Stack image layout in a snapshot's stack file, per recorded thread in id
//! order:
//!
//! ```text
//!   scalar  sp            0 when the thread has no saved state
//!   bytes   ArchContext
//!   scalar  stack_bytes   stack_end - sp
//!   bytes   stack_bytes   top window, then the live stack above it
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, Ordering};

use rewind_hal::arch::{capture_context, restore_context, ArchContext, Capture, STACK_TOP_SIZE};
use rewindfs::Stream;

use crate::error::{ExecError, ExecResult};
use crate::thread::{ThreadId, MAIN_THREAD_ID};

/// Largest stack image accepted when loading.
const MAX_STACK_BYTES: usize = 64 << 20;

struct SavedStack {
    context: ArchContext,
    top: [u8; STACK_TOP_SIZE],
    /// Full image loaded for a restore
    contents: Vec<u8>,
}

struct ThreadState {
    should_restore: AtomicBool,
    saved: UnsafeCell<SavedStack>,
}

// SAFETY: a thread writes its own saved state only while running, and the
// main thread reads or replaces it only while that thread is idle.
unsafe impl Sync for ThreadState {}

impl ThreadState {
    fn new() -> Self {
        Self {
            should_restore: AtomicBool::new(false),
            saved: UnsafeCell::new(SavedStack {
                context: ArchContext::default(),
                top: [0; STACK_TOP_SIZE],
                contents: Vec::new(),
            }),
        }
    }
}

/// Saved stacks of every recorded thread.
pub struct ThreadSnapshots {
    states: Vec<ThreadState>,
}

impl fmt::Debug for ThreadSnapshots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSnapshots")
            .field("threads", &self.states.len())
            .finish()
    }
}

fn context_bytes(context: &ArchContext) -> &[u8] {
    // SAFETY: ArchContext is repr(C) plain integers
    unsafe {
        core::slice::from_raw_parts(
            (context as *const ArchContext).cast::<u8>(),
            size_of::<ArchContext>(),
        )
    }
}

fn context_bytes_mut(context: &mut ArchContext) -> &mut [u8] {
    // SAFETY: ArchContext is repr(C) plain integers; any bytes are valid
    unsafe {
        core::slice::from_raw_parts_mut(
            (context as *mut ArchContext).cast::<u8>(),
            size_of::<ArchContext>(),
        )
    }
}

impl ThreadSnapshots {
    /// Saved state slots for recorded ids `1..=max_recorded`.
    pub fn new(max_recorded: usize) -> Self {
        Self {
            states: (MAIN_THREAD_ID..=max_recorded).map(|_| ThreadState::new()).collect(),
        }
    }

    fn state(&self, id: ThreadId) -> &ThreadState {
        &self.states[id - MAIN_THREAD_ID]
    }

    /// Capture the calling thread's context. Returns true after capturing,
    /// false when a restore resumes execution here.
    ///
    /// `separator` must be a local of the caller's caller, so that every
    /// frame between it and the capture point fits in the top window.
    #[inline(never)]
    pub fn save_thread_state(&self, id: ThreadId, separator: *const u8) -> ExecResult<bool> {
        let state = self.state(id);
        let saved = state.saved.get();
        // SAFETY: only thread `id` calls this, on its own state; the separator
        // frame outlives every restore of this capture
        let capture = unsafe {
            capture_context(
                core::ptr::addr_of_mut!((*saved).context),
                core::ptr::addr_of_mut!((*saved).top),
                separator,
            )
        };
        match capture {
            Capture::Saved => Ok(true),
            Capture::Restored => {
                // SAFETY: the image was copied into place; nothing reads it now
                unsafe { (*saved).contents = Vec::new() };
                state.should_restore.store(false, Ordering::SeqCst);
                Ok(false)
            }
            Capture::WindowTooLarge => Err(ExecError::StackWindow(id)),
        }
    }

    /// Whether thread `id` has a loaded image waiting to be restored.
    #[inline]
    pub fn should_restore(&self, id: ThreadId) -> bool {
        self.state(id).should_restore.load(Ordering::SeqCst)
    }

    /// Write thread `id`'s stack image. The thread must be idle, or be the
    /// caller inside the frame that captured it.
    pub fn write_stack(&self, stream: &mut Stream, id: ThreadId, stack_end: usize) -> ExecResult<()> {
        // SAFETY: the owning thread is idle or is the caller
        let saved = unsafe { &*self.state(id).saved.get() };
        let sp = saved.context.stack_pointer();
        if sp == 0 || stack_end == 0 {
            stream.write_scalar(0)?;
            return Ok(());
        }
        let top = saved.context.top_bytes as usize;
        if sp >= stack_end || top > STACK_TOP_SIZE || sp + top > stack_end {
            return Err(ExecError::BadStack {
                thread: id,
                problem: "capture point outside the stack",
            });
        }

        stream.write_scalar(sp as u64)?;
        stream.write_bytes(context_bytes(&saved.context))?;
        stream.write_scalar((stack_end - sp) as u64)?;
        stream.write_bytes(&saved.top[..top])?;
        // SAFETY: [sp + top, stack_end) is the thread's stack above its
        // separator, unchanged while it stays captured
        let live = unsafe {
            core::slice::from_raw_parts((sp + top) as *const u8, stack_end - sp - top)
        };
        stream.write_bytes(live)?;
        Ok(())
    }

    /// Read thread `id`'s stack image and mark it for restoring.
    pub fn load_stack(&self, stream: &mut Stream, id: ThreadId, stack_end: usize) -> ExecResult<()> {
        let state = self.state(id);
        // SAFETY: every recorded thread is idle while stacks are loaded
        let saved = unsafe { &mut *state.saved.get() };

        let sp = stream.read_scalar()? as usize;
        if sp == 0 {
            saved.contents = Vec::new();
            state.should_restore.store(false, Ordering::SeqCst);
            return Ok(());
        }
        let mut context = ArchContext::default();
        stream.read_bytes(context_bytes_mut(&mut context))?;
        let len = stream.read_scalar()? as usize;
        if context.stack_pointer() != sp || sp >= stack_end || len != stack_end - sp {
            return Err(ExecError::BadStack {
                thread: id,
                problem: "image does not match the thread's stack",
            });
        }
        if len > MAX_STACK_BYTES {
            return Err(ExecError::BadStack {
                thread: id,
                problem: "image too large",
            });
        }
        let mut contents = vec![0u8; len];
        stream.read_bytes(&mut contents)?;

        saved.context = context;
        saved.contents = contents;
        state.should_restore.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Copy the loaded image over thread `id`'s stack and resume at its
    /// capture point.
    ///
    /// # Safety
    /// Must be called on thread `id`, after [`load_stack`](Self::load_stack),
    /// with no live frame of the caller below the stack end that needs to
    /// survive.
    pub unsafe fn restore_thread_stack(&self, id: ThreadId) -> ! {
        let saved = self.state(id).saved.get();
        // SAFETY: context and contents live in this table, off every stack
        unsafe {
            let contents = core::slice::from_raw_parts((*saved).contents.as_ptr(), (*saved).contents.len());
            restore_context(core::ptr::addr_of_mut!((*saved).context), contents)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewindfs::{File, StreamName};

    #[test]
    fn capture_reports_saved_then_restore_returns_false() {
        let snapshots = ThreadSnapshots::new(1);
        let restored = core::sync::atomic::AtomicUsize::new(0);
        // The whole round trip happens inside one frame chain so the stack
        // above the separator is still intact when the image is reapplied.
        fn round_trip(snapshots: &ThreadSnapshots, restored: &core::sync::atomic::AtomicUsize) {
            let separator = 0u8;
            inner(snapshots, restored, core::ptr::addr_of!(separator));
        }
        #[inline(never)]
        fn inner(
            snapshots: &ThreadSnapshots,
            restored: &core::sync::atomic::AtomicUsize,
            separator: *const u8,
        ) {
            let end = separator as usize + 256;
            if snapshots.save_thread_state(MAIN_THREAD_ID, separator).unwrap() {
                let dir = tempfile::tempdir().unwrap();
                let file = File::create(dir.path().join("stack")).unwrap();
                let stream = file.open_stream(StreamName::Main, 0);
                snapshots.write_stack(&mut stream.lock(), MAIN_THREAD_ID, end).unwrap();
                file.switch_to_replay().unwrap();
                let stream = file.open_stream(StreamName::Main, 0);
                stream.lock().seek(0).unwrap();
                snapshots.load_stack(&mut stream.lock(), MAIN_THREAD_ID, end).unwrap();
                assert!(snapshots.should_restore(MAIN_THREAD_ID));
                drop(stream);
                drop(file);
                drop(dir);
                // SAFETY: same thread, image loaded, nothing to unwind
                unsafe { snapshots.restore_thread_stack(MAIN_THREAD_ID) };
            }
            restored.fetch_add(1, Ordering::SeqCst);
        }
        round_trip(&snapshots, &restored);
        assert_eq!(restored.load(Ordering::SeqCst), 1);
        assert!(!snapshots.should_restore(MAIN_THREAD_ID));
    }

    #[test]
    fn separator_too_far_up_is_refused() {
        let snapshots = ThreadSnapshots::new(1);
        let far = 0u8;
        let separator = (core::ptr::addr_of!(far) as usize + 4 * STACK_TOP_SIZE) as *const u8;
        assert!(matches!(
            snapshots.save_thread_state(MAIN_THREAD_ID, separator),
            Err(ExecError::StackWindow(MAIN_THREAD_ID))
        ));
    }

    #[test]
    fn missing_state_loads_as_nothing_to_restore() {
        let snapshots = ThreadSnapshots::new(2);
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("empty")).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        snapshots.write_stack(&mut stream.lock(), 2, 0).unwrap();
        file.switch_to_replay().unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        stream.lock().seek(0).unwrap();
        snapshots.load_stack(&mut stream.lock(), 2, 0x1000).unwrap();
        assert!(!snapshots.should_restore(2));
    }
}
