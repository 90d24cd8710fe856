//! Signal handling: SIGTERM/SIGINT cancel the shared [`ShutdownToken`],
//! SIGUSR1 requests an immediate cleanup sweep.
//!
//! Uses the `signal-hook` crate for safe signal registration. Background loops
//! poll the flags at their own cadence rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

use crate::daemon::shutdown::ShutdownToken;

/// Signal state shared between the OS handlers and the service threads.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    sweep_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks.
    ///
    /// Registration is best-effort; failures are logged to stderr but not fatal.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Handler with no OS hooks, driven only programmatically.
    #[must_use]
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            sweep_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token cancelled by SIGTERM/SIGINT.
    #[must_use]
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken::from_flag(Arc::clone(&self.shutdown_flag))
    }

    /// Flag set by SIGUSR1; the cleanup loop clears it when it sweeps.
    #[must_use]
    pub fn sweep_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sweep_flag)
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    pub fn request_sweep(&self) {
        self.sweep_flag.store(true, Ordering::SeqCst);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[SG-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[SG-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.sweep_flag)) {
                eprintln!("[SG-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programmatic_shutdown_cancels_token() {
        let handler = SignalHandler::unregistered();
        let token = handler.token();
        assert!(!token.is_cancelled());
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelling_token_is_visible_to_handler() {
        let handler = SignalHandler::unregistered();
        handler.token().cancel();
        assert!(handler.should_shutdown());
    }

    #[test]
    fn sweep_flag_is_shared() {
        let handler = SignalHandler::unregistered();
        let flag = handler.sweep_flag();
        handler.request_sweep();
        assert!(flag.swap(false, Ordering::SeqCst));
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[test]
    fn sigusr1_sets_sweep_flag() {
        let handler = SignalHandler::new();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();
        assert!(handler.sweep_flag().load(Ordering::SeqCst));
        assert!(!handler.should_shutdown());
    }

    #[test]
    fn handler_is_clone_and_send() {
        fn assert_send<T: Send + Sync + Clone>() {}
        assert_send::<SignalHandler>();
    }
}
