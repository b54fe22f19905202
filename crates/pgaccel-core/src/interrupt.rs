//! Session cancellation.
//!
//! The host raises the flag (typically from a signal handler); long-running
//! operations call `check_for_interrupts()` at every suspension point.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CoreError;

static CANCEL_PENDING: AtomicBool = AtomicBool::new(false);

/// Request cancellation of the current statement. Safe from signal handlers.
pub fn request_cancel() {
    CANCEL_PENDING.store(true, Ordering::SeqCst);
    #[cfg(unix)]
    crate::latch::session_latch().set();
}

pub fn clear_cancel() {
    CANCEL_PENDING.store(false, Ordering::SeqCst);
}

pub fn cancel_pending() -> bool {
    CANCEL_PENDING.load(Ordering::SeqCst)
}

pub fn check_for_interrupts() -> Result<(), CoreError> {
    if cancel_pending() {
        Err(CoreError::QueryCancelled)
    } else {
        Ok(())
    }
}
