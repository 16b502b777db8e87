use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SigHandler, Signal};

/// Set from the SIGINT handler; seen by every CancelToken
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler that cancels all running stages instead of killing the process
/// outright, so worker process groups can be cleaned up.
pub fn install_interrupt_handler() -> Result<(), nix::Error> {
    // Only stores to an atomic, which is async-signal-safe
    unsafe { signal::signal(Signal::SIGINT, SigHandler::Handler(handle_interrupt)) }?;
    Ok(())
}

/// Shared cancellation flag checked by the runner on every poll tick
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || INTERRUPTED.load(Ordering::SeqCst)
    }
}
