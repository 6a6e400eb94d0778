//! # AArch64 Context Capture

use core::mem::{offset_of, size_of};

/// Callee-saved state of a thread at a capture point.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchContext {
    /// x19..x28
    pub x: [u64; 10],
    /// Frame pointer (x29)
    pub fp: u64,
    /// Link register (x30), the capture call's return address
    pub lr: u64,
    /// Stack pointer at entry of the capture stub
    pub sp: u64,
    /// Low halves of v8..v15
    pub d: [u64; 8],
    /// Bytes copied from the stack at capture time
    pub top_bytes: u64,
    /// Source of the stack image copied in by a restore
    pub restore_contents: u64,
    /// Length of the stack image copied in by a restore
    pub restore_len: u64,
}

static_assertions::const_assert_eq!(size_of::<ArchContext>(), 192);
static_assertions::const_assert_eq!(offset_of!(ArchContext, sp), 96);
static_assertions::const_assert_eq!(offset_of!(ArchContext, d), 104);
static_assertions::const_assert_eq!(offset_of!(ArchContext, top_bytes), 168);
static_assertions::const_assert_eq!(offset_of!(ArchContext, restore_contents), 176);
static_assertions::const_assert_eq!(offset_of!(ArchContext, restore_len), 184);

impl ArchContext {
    /// Stack pointer captured for this context.
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

// rewind_capture_context(ctx: x0, top: x1, separator: x2) -> x0
// rewind_restore_context(ctx: x0) -> ! (returns 1 from the capture call)
core::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl rewind_capture_context",
    ".type rewind_capture_context,%function",
    "rewind_capture_context:",
    "stp x19, x20, [x0, #0]",
    "stp x21, x22, [x0, #16]",
    "stp x23, x24, [x0, #32]",
    "stp x25, x26, [x0, #48]",
    "stp x27, x28, [x0, #64]",
    "stp x29, x30, [x0, #80]",
    "mov x9, sp",
    "str x9, [x0, #96]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "sub x10, x2, x9",
    "cmp x10, #2048",
    "b.hi 5f",
    "str x10, [x0, #168]",
    "2:",
    "cbz x10, 3f",
    "ldrb w11, [x9], #1",
    "strb w11, [x1], #1",
    "sub x10, x10, #1",
    "b 2b",
    "3:",
    "mov x0, #0",
    "ret",
    "5:",
    "mov x0, #2",
    "ret",
    ".size rewind_capture_context, . - rewind_capture_context",
    "",
    ".p2align 2",
    ".globl rewind_restore_context",
    ".type rewind_restore_context,%function",
    "rewind_restore_context:",
    "ldr x9, [x0, #96]",
    "mov sp, x9",
    "ldr x10, [x0, #184]",
    "ldr x11, [x0, #176]",
    "2:",
    "cbz x10, 3f",
    "ldrb w12, [x11], #1",
    "strb w12, [x9], #1",
    "sub x10, x10, #1",
    "b 2b",
    "3:",
    "ldp x19, x20, [x0, #0]",
    "ldp x21, x22, [x0, #16]",
    "ldp x23, x24, [x0, #32]",
    "ldp x25, x26, [x0, #48]",
    "ldp x27, x28, [x0, #64]",
    "ldp x29, x30, [x0, #80]",
    "ldp d8, d9, [x0, #104]",
    "ldp d10, d11, [x0, #120]",
    "ldp d12, d13, [x0, #136]",
    "ldp d14, d15, [x0, #152]",
    "mov x0, #1",
    "ret",
    ".size rewind_restore_context, . - rewind_restore_context",
);
