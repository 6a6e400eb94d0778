//! # Architecture Support
//!
//! Restartable context capture. [`capture_context`] saves the callee-saved
//! registers and stack pointer and returns [`Capture::Saved`]. A later
//! [`restore_context`] on the same thread copies a stack image back in place
//! and resumes as if that capture call had returned a second time, now with
//! [`Capture::Restored`]. Register knowledge stays in the per-architecture
//! stubs; the rest of the system only sees [`ArchContext`] as opaque bytes.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::ArchContext;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::ArchContext;
    } else {
        compile_error!("context capture is only implemented for x86_64 and aarch64");
    }
}

/// Bytes of stack copied at capture time, covering the window between the
/// capture point and the caller-provided separator.
pub const STACK_TOP_SIZE: usize = 2048;

extern "C" {
    fn rewind_capture_context(ctx: *mut ArchContext, top: *mut u8, separator: *const u8) -> usize;
    fn rewind_restore_context(ctx: *const ArchContext) -> !;
}

/// Outcome of a capture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// State was just saved
    Saved,
    /// Execution resumed here through [`restore_context`]
    Restored,
    /// The separator is farther than [`STACK_TOP_SIZE`] bytes up the stack
    WindowTooLarge,
}

/// Save the calling thread's context and the stack bytes between the stack
/// pointer and `separator`.
///
/// # Safety
/// `separator` must point into a frame of the calling thread that stays live
/// for as long as the context may be restored. Frames between the caller and
/// the separator must not own resources whose release would be repeated by a
/// second return.
#[inline(always)]
pub unsafe fn capture_context(
    ctx: *mut ArchContext,
    top: *mut [u8; STACK_TOP_SIZE],
    separator: *const u8,
) -> Capture {
    // SAFETY: forwarded caller contract; both buffers are valid for writes
    match unsafe { rewind_capture_context(ctx, top.cast::<u8>(), separator) } {
        0 => Capture::Saved,
        1 => Capture::Restored,
        _ => Capture::WindowTooLarge,
    }
}

/// Copy `contents` over the stack starting at the context's stack pointer
/// and resume at the context's capture point.
///
/// # Safety
/// `ctx` must hold a context captured on the calling thread and `contents`
/// an image of that thread's stack from the captured stack pointer upward.
/// Neither may live on the stack being overwritten.
pub unsafe fn restore_context(ctx: *mut ArchContext, contents: &[u8]) -> ! {
    // SAFETY: caller guarantees ctx and contents are valid and off-stack
    unsafe {
        (*ctx).restore_contents = contents.as_ptr() as u64;
        (*ctx).restore_len = contents.len() as u64;
        rewind_restore_context(ctx)
    }
}
