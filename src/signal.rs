/// Shutdown signal handling for the orchestrator
use crate::types::{LxceError, Result};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Records SIGINT, SIGTERM and SIGHUP for the main loop to act on
pub struct SignalHandler;

impl SignalHandler {
    /// Install the handlers, call before any space thread is started
    pub fn init() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                LxceError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    // atomics only
    extern "C" fn on_signal(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that requested shutdown, if any
    pub fn received(&self) -> Option<Signal> {
        match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            n => Signal::try_from(n).ok(),
        }
    }
}
