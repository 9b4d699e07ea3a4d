//! Cooperative cancellation shared by the pipeline and the executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest stretch a cancellable sleep goes without checking the token.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cancellation token checked between stages and between operations.
///
/// Clones share state. A token may also be linked to a process-wide
/// shutdown flag (see [`crate::signals`]).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    linked: Option<&'static AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also observes a static shutdown flag.
    pub fn linked_to(flag: &'static AtomicBool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            linked: Some(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.linked.is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` when cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
