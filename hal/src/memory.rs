//! Page-granular memory primitives.
//!
//! Thin wrappers over `mmap`/`munmap`/`mprotect` plus the address arithmetic
//! shared by the snapshot machinery. Every function here is async-signal-safe
//! so the fault handler may call it.

use core::ptr::NonNull;
use std::io;

use crate::error::{HalError, HalResult};

/// Size of a tracked page. Protection and dirty tracking work on this grain.
pub const PAGE_SIZE: usize = 4096;

bitflags::bitflags! {
    /// Access rights applied to a range of pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// Protection of a write-protected tracked page.
    pub const fn tracked(executable: bool) -> Self {
        if executable {
            Self::READ.union(Self::EXEC)
        } else {
            Self::READ
        }
    }

    /// Protection of a writable page.
    pub const fn writable(executable: bool) -> Self {
        if executable {
            Self::READ.union(Self::WRITE).union(Self::EXEC)
        } else {
            Self::READ.union(Self::WRITE)
        }
    }

    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

// ============================================================================
// Address arithmetic
// ============================================================================

/// Base address of the page containing `addr`.
#[inline]
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Whether `[base, base + size)` fully contains `[addr, addr + len)`.
#[inline]
pub const fn memory_contains(base: usize, size: usize, addr: usize, len: usize) -> bool {
    addr >= base && addr + len <= base + size
}

/// Whether the two ranges share at least one byte.
#[inline]
pub const fn memory_intersects(base: usize, size: usize, addr: usize, len: usize) -> bool {
    addr < base + size && base < addr + len
}

// ============================================================================
// Mapping
// ============================================================================

/// Map `size` bytes of fresh zeroed, readable and writable memory.
pub fn map_anonymous(size: usize) -> HalResult<NonNull<u8>> {
    // SAFETY: anonymous private mapping with no fixed address
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(HalError::map(size));
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| HalError::map(size))
}

/// Unmap a range previously returned by [`map_anonymous`].
///
/// # Safety
/// No live reference may point into the range.
pub unsafe fn unmap(base: usize, size: usize) -> HalResult<()> {
    // SAFETY: caller guarantees the range is unused
    if unsafe { libc::munmap(base as *mut libc::c_void, size) } != 0 {
        return Err(HalError::Unmap {
            base,
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Change the protection of a page-aligned range.
pub fn protect(base: usize, size: usize, protection: Protection) -> HalResult<()> {
    debug_assert_eq!(base % PAGE_SIZE, 0);
    // SAFETY: mprotect only changes access rights; invalid ranges fail with ENOMEM
    if unsafe { libc::mprotect(base as *mut libc::c_void, size, protection.to_native()) } != 0 {
        return Err(HalError::Protect {
            base,
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Change protection from signal context, reporting only success.
#[inline]
pub fn protect_quiet(base: usize, size: usize, protection: Protection) -> bool {
    // SAFETY: see `protect`
    unsafe { libc::mprotect(base as *mut libc::c_void, size, protection.to_native()) == 0 }
}
