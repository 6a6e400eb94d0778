//! # Fatal Errors
//!
//! Unrecoverable failures (replay mismatches, corrupt recordings, faults
//! outside tracked memory) are reported once and then the failing thread
//! parks forever. The process is left intact for a debugger or controller to
//! inspect and tear down.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Maximum number of nested fatal reports before giving up on reporting
const MAX_FATAL_DEPTH: usize = 3;

static FATAL_DEPTH: AtomicUsize = AtomicUsize::new(0);
static IN_FATAL_HANDLER: AtomicBool = AtomicBool::new(false);

static HANDLER: spin::RwLock<Option<&'static dyn FatalHandler>> = spin::RwLock::new(None);

/// Receives fatal error reports before the failing thread parks.
pub trait FatalHandler: Send + Sync {
    /// Handle a fatal error. Must not return control to the failing code.
    fn handle_fatal(&self, message: &str);
}

/// Register the process-wide fatal handler.
pub fn register_fatal_handler(handler: &'static dyn FatalHandler) {
    *HANDLER.write() = Some(handler);
}

/// Whether some thread has already reported a fatal error.
pub fn has_failed() -> bool {
    FATAL_DEPTH.load(Ordering::SeqCst) > 0
}

/// Report an unrecoverable error and park the calling thread.
#[inline(never)]
#[cold]
pub fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    let depth = FATAL_DEPTH.fetch_add(1, Ordering::SeqCst);
    if depth >= MAX_FATAL_DEPTH {
        park_forever();
    }

    let message = args.to_string();
    log::error!("Fatal error: {}", message);

    // Only the first report reaches the controller.
    if !IN_FATAL_HANDLER.swap(true, Ordering::SeqCst) {
        if let Some(handler) = *HANDLER.read() {
            handler.handle_fatal(&message);
        }
    }

    park_forever()
}

/// Block the calling thread until the process is torn down.
pub fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

/// Report a fatal error with `format!`-style arguments.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::fatal_error(format_args!($($arg)*))
    };
}

/// Assert a condition, reporting a fatal error if false
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::fatal!(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}
