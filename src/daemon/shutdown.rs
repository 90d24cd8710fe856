//! Shared cancellation token observed by every background loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single sleep between cancellation checks.
const DEFAULT_SLICE: Duration = Duration::from_millis(250);

/// Cloneable cancellation flag with interruptible sleeps.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag (e.g. one registered with a signal handler).
    #[must_use]
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `total`, waking every 250ms to check the flag.
    /// Returns `false` when cancelled before the full duration elapsed.
    pub fn sleep(&self, total: Duration) -> bool {
        self.sleep_in_slices(total, DEFAULT_SLICE)
    }

    /// Sleep up to `total` in increments of at most `slice`.
    pub fn sleep_in_slices(&self, total: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = slice.max(Duration::from_millis(1));
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise leave it detached.
///
/// Returns `true` when the thread was joined.
pub fn join_with_timeout<T>(name: &str, handle: JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            eprintln!(
                "[SG-DAEMON] {name} thread did not stop within {}s; continuing shutdown",
                timeout.as_secs()
            );
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    if handle.join().is_err() {
        eprintln!("[SG-DAEMON] {name} thread panicked during shutdown");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = ShutdownToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = ShutdownToken::new();
        assert!(token.sleep_in_slices(Duration::from_millis(30), Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn join_with_timeout_detaches_stuck_threads() {
        let token = ShutdownToken::new();
        let stuck_token = token.clone();
        let stuck = thread::spawn(move || {
            while !stuck_token.is_cancelled() {
                thread::sleep(Duration::from_millis(10));
            }
        });
        assert!(!join_with_timeout("stuck", stuck, Duration::from_millis(100)));
        token.cancel();

        let quick = thread::spawn(|| 7);
        assert!(join_with_timeout("quick", quick, Duration::from_secs(5)));
    }
}
