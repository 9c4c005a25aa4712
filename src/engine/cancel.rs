//! Cooperative cancellation for the generation loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared flag raised by an interrupt and polled at token boundaries.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag. Called at the start of each generation turn.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
