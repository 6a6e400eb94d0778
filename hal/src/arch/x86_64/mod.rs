//! # x86_64 Context Capture
//!
//! Callee-saved register file plus the stack window copy performed at
//! capture time. The layout is shared with the assembly stubs below; offsets
//! are checked at compile time.

use core::mem::{offset_of, size_of};

// =============================================================================
// Arch Context
// =============================================================================

/// Callee-saved state of a thread at a capture point.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchContext {
    /// Callee-saved general purpose registers
    pub rbx: u64,
    /// Frame pointer
    pub rbp: u64,
    /// Callee-saved general purpose registers
    pub r12: u64,
    /// Callee-saved general purpose registers
    pub r13: u64,
    /// Callee-saved general purpose registers
    pub r14: u64,
    /// Callee-saved general purpose registers
    pub r15: u64,
    /// Stack pointer at entry of the capture stub (points at the return address)
    pub rsp: u64,
    /// SSE control/status
    pub mxcsr: u32,
    /// x87 control word
    pub fpu_control: u16,
    pad: u16,
    /// Bytes copied from the stack at capture time
    pub top_bytes: u64,
    /// Source of the stack image copied in by a restore
    pub restore_contents: u64,
    /// Length of the stack image copied in by a restore
    pub restore_len: u64,
}

static_assertions::const_assert_eq!(size_of::<ArchContext>(), 88);
static_assertions::const_assert_eq!(offset_of!(ArchContext, rsp), 48);
static_assertions::const_assert_eq!(offset_of!(ArchContext, mxcsr), 56);
static_assertions::const_assert_eq!(offset_of!(ArchContext, fpu_control), 60);
static_assertions::const_assert_eq!(offset_of!(ArchContext, top_bytes), 64);
static_assertions::const_assert_eq!(offset_of!(ArchContext, restore_contents), 72);
static_assertions::const_assert_eq!(offset_of!(ArchContext, restore_len), 80);

impl ArchContext {
    /// Stack pointer captured for this context.
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

// =============================================================================
// Assembly stubs
// =============================================================================

// rewind_capture_context(ctx: rdi, top: rsi, separator: rdx) -> rax
//   0: captured, 2: window between rsp and separator exceeds the top buffer
// rewind_restore_context(ctx: rdi) -> ! (returns 1 from the capture call)
core::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl rewind_capture_context",
    ".type rewind_capture_context,@function",
    "rewind_capture_context:",
    "mov qword ptr [rdi + 0], rbx",
    "mov qword ptr [rdi + 8], rbp",
    "mov qword ptr [rdi + 16], r12",
    "mov qword ptr [rdi + 24], r13",
    "mov qword ptr [rdi + 32], r14",
    "mov qword ptr [rdi + 40], r15",
    "mov qword ptr [rdi + 48], rsp",
    "stmxcsr dword ptr [rdi + 56]",
    "fnstcw word ptr [rdi + 60]",
    "mov rcx, rdx",
    "sub rcx, rsp",
    "cmp rcx, 2048",
    "ja 5f",
    "mov qword ptr [rdi + 64], rcx",
    "mov r8, rsp",
    "2:",
    "test rcx, rcx",
    "jz 3f",
    "mov al, byte ptr [r8]",
    "mov byte ptr [rsi], al",
    "inc r8",
    "inc rsi",
    "dec rcx",
    "jmp 2b",
    "3:",
    "xor eax, eax",
    "ret",
    "5:",
    "mov eax, 2",
    "ret",
    ".size rewind_capture_context, . - rewind_capture_context",
    "",
    ".p2align 4",
    ".globl rewind_restore_context",
    ".type rewind_restore_context,@function",
    "rewind_restore_context:",
    "mov rsp, qword ptr [rdi + 48]",
    "mov rsi, qword ptr [rdi + 72]",
    "mov rcx, qword ptr [rdi + 80]",
    "mov r8, rsp",
    "2:",
    "test rcx, rcx",
    "jz 3f",
    "mov al, byte ptr [rsi]",
    "mov byte ptr [r8], al",
    "inc rsi",
    "inc r8",
    "dec rcx",
    "jmp 2b",
    "3:",
    "mov rbx, qword ptr [rdi + 0]",
    "mov rbp, qword ptr [rdi + 8]",
    "mov r12, qword ptr [rdi + 16]",
    "mov r13, qword ptr [rdi + 24]",
    "mov r14, qword ptr [rdi + 32]",
    "mov r15, qword ptr [rdi + 40]",
    "ldmxcsr dword ptr [rdi + 56]",
    "fldcw word ptr [rdi + 60]",
    "mov eax, 1",
    "ret",
    ".size rewind_restore_context, . - rewind_restore_context",
);
