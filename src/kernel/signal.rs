use crate::config::types::{MarksError, Result};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe operator interrupt handling
///
/// The handler only stores atomics; coordinator and worker loops poll
/// `should_continue()` and do the actual teardown.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers.
    /// Must run before workers are forked so they inherit the disposition.
    pub fn init() -> Result<Self> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<()> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &sig_action) }.map_err(|e| {
                MarksError::Signal(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Async-safe signal handler
    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// Main loop helper that checks for signals
/// Returns true if should continue, false if should shutdown
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Request shutdown without a signal (programmatic cancellation)
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Reset shutdown flag
pub fn reset() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
}
