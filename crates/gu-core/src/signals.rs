//! Process-wide shutdown flag driven by SIGINT/SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// The flag set by the installed handler.
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN
}

#[cfg(unix)]
extern "C" fn on_signal(_signum: libc::c_int) {
    // Only an atomic store is async-signal-safe here.
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that set the shutdown flag.
///
/// A second signal keeps the flag set; loops observe it at their next poll.
#[cfg(unix)]
pub fn install_shutdown_handler() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() {}
