use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the diagnostic stream is enabled (`-V`/`--verbose`).
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enable or disable the diagnostic stream. Called once from `main`.
pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Write a line to stderr when verbose diagnostics are enabled.
///
/// Without `-V` the runtime is silent; failures surface through the exit
/// code alone. Never call this from a signal handler.
macro_rules! diag {
    ($($arg:tt)*) => {
        if $crate::util::log::verbose() {
            eprintln!($($arg)*);
        }
    };
}

pub(crate) use diag;
