//! Memory fault dispatch.
//!
//! A single process-wide handler receives the faulting address of every
//! `SIGSEGV`/`SIGBUS`. When it reports the fault handled, the faulting
//! instruction is retried. Otherwise the previous disposition is reinstated
//! and the retried access faults again into it, so unrelated crashes and
//! stack overflows keep their normal behavior.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;

use crate::error::{HalError, HalResult};

/// Handler invoked with the faulting address. Returns whether the fault was
/// resolved. Runs in signal context: it must not allocate or block.
pub type FaultHandler = fn(usize) -> bool;

const SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

static HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Dispositions replaced by ours, set once installation finished. Read
/// from signal context, so never behind a lock.
static PREVIOUS: spin::Once<[libc::sigaction; 2]> = spin::Once::new();

extern "C" fn on_fault(signal: libc::c_int, info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers
    let addr = unsafe { (*info).si_addr() } as usize;

    let handler = HANDLER.load(Ordering::Acquire);
    if handler != 0 {
        // SAFETY: only `FaultHandler` values are stored in HANDLER
        let handler: FaultHandler = unsafe { core::mem::transmute::<usize, FaultHandler>(handler) };
        if handler(addr) {
            return;
        }
    }

    restore_previous(signal);
}

fn previous_action(signal: libc::c_int) -> Option<&'static libc::sigaction> {
    let slot = SIGNALS.iter().position(|&s| s == signal)?;
    PREVIOUS.get().map(|previous| &previous[slot])
}

fn restore_previous(signal: libc::c_int) {
    // SAFETY: reinstalling a disposition captured by sigaction, or the default
    unsafe {
        match previous_action(signal) {
            Some(action) => {
                libc::sigaction(signal, action, core::ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
    }
}

/// Route memory faults to `handler`, replacing any handler set earlier.
///
/// The signal handlers are installed once; later calls only swap the
/// dispatch target.
pub fn install_fault_handler(handler: FaultHandler) -> HalResult<()> {
    HANDLER.store(handler as usize, Ordering::Release);

    PREVIOUS.try_call_once(install_signal_handlers)?;
    Ok(())
}

/// Stop routing faults to the installed handler.
pub fn clear_fault_handler() {
    HANDLER.store(0, Ordering::Release);
}

fn install_signal_handlers() -> HalResult<[libc::sigaction; 2]> {
    // SAFETY: sigaction is plain data; zero is a valid empty action
    let mut previous: [libc::sigaction; 2] = unsafe { core::mem::zeroed() };
    for (slot, &signal) in SIGNALS.iter().enumerate() {
        // SAFETY: the action is fully initialized before use
        unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = on_fault as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            let mut old: libc::sigaction = core::mem::zeroed();
            if libc::sigaction(signal, &action, &mut old) != 0 {
                return Err(HalError::Signal {
                    signal,
                    source: io::Error::last_os_error(),
                });
            }
            previous[slot] = old;
        }
    }
    log::debug!("memory fault handlers installed");
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, Protection, PAGE_SIZE};
    use core::sync::atomic::AtomicUsize;

    static PAGE: AtomicUsize = AtomicUsize::new(0);
    static FAULTS: AtomicUsize = AtomicUsize::new(0);

    fn unprotect_on_fault(addr: usize) -> bool {
        let page = PAGE.load(Ordering::SeqCst);
        if page == 0 || memory::page_base(addr) != page {
            return false;
        }
        FAULTS.fetch_add(1, Ordering::SeqCst);
        memory::protect_quiet(page, PAGE_SIZE, Protection::writable(false))
    }

    #[test]
    fn write_to_protected_page_reaches_handler() {
        let page = memory::map_anonymous(PAGE_SIZE).unwrap().as_ptr() as usize;
        memory::protect(page, PAGE_SIZE, Protection::READ).unwrap();
        PAGE.store(page, Ordering::SeqCst);
        install_fault_handler(unprotect_on_fault).unwrap();

        // SAFETY: the handler makes the page writable on first touch
        unsafe {
            core::ptr::write_volatile((page + 8) as *mut u8, 0x5a);
            core::ptr::write_volatile((page + 9) as *mut u8, 0x5b);
        }
        assert_eq!(FAULTS.load(Ordering::SeqCst), 1);
        // SAFETY: page is mapped and readable
        assert_eq!(unsafe { *((page + 8) as *const u8) }, 0x5a);

        clear_fault_handler();
        PAGE.store(0, Ordering::SeqCst);
    }

    #[test]
    fn previous_dispositions_are_kept_for_chaining() {
        install_fault_handler(unprotect_on_fault).unwrap();
        for signal in SIGNALS {
            let previous = previous_action(signal).unwrap();
            assert_ne!(previous.sa_sigaction, on_fault as usize);
        }
        assert!(previous_action(libc::SIGINT).is_none());
        // A second install swaps the target without reinstalling.
        install_fault_handler(unprotect_on_fault).unwrap();
        assert_ne!(previous_action(libc::SIGSEGV).unwrap().sa_sigaction, on_fault as usize);
        clear_fault_handler();
    }
}
