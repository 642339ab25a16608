//! Failure injection for in-memory collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Makes an operation fail on demand.
///
/// Either the next `n` calls fail, or every call fails until switched off.
/// Clones share state, so a test keeps one handle while the backend holds another.
#[derive(Clone, Debug, Default)]
pub struct FaultSwitch {
    remaining: Arc<AtomicU32>,
    always: Arc<AtomicBool>,
}

impl FaultSwitch {
    /// A switch that never trips.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every call while `on`.
    pub fn fail_always(&self, on: bool) {
        self.always.store(on, Ordering::SeqCst);
    }

    /// Clear every pending failure.
    pub fn reset(&self) {
        self.remaining.store(0, Ordering::SeqCst);
        self.always.store(false, Ordering::SeqCst);
    }

    /// Consume one failure if any is armed. Backends call this first.
    #[must_use]
    pub fn trip(&self) -> bool {
        if self.always.load(Ordering::SeqCst) {
            return true;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
