//! Thread stack bounds.

use crate::error::{HalError, HalResult};

/// Address range of a thread's stack. The stack grows down from `end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest mapped address
    pub base: usize,
    /// One past the highest address
    pub end: usize,
}

impl StackBounds {
    /// Size of the whole stack mapping.
    pub fn size(&self) -> usize {
        self.end - self.base
    }

    /// Whether `addr` lies on this stack.
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end
    }
}

/// Query the stack of the calling thread.
pub fn current_thread_stack() -> HalResult<StackBounds> {
    // SAFETY: the attribute object is initialized by pthread_getattr_np and
    // destroyed before returning
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        let rv = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if rv != 0 {
            return Err(HalError::StackQuery(rv));
        }
        let mut addr: *mut libc::c_void = core::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rv = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rv != 0 {
            return Err(HalError::StackQuery(rv));
        }
        Ok(StackBounds {
            base: addr as usize,
            end: addr as usize + size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_lies_on_current_stack() {
        let local = 0u64;
        let bounds = current_thread_stack().unwrap();
        assert!(bounds.contains(core::hint::black_box(&local) as *const u64 as usize));
    }
}
