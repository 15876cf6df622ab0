//! Cooperative cancellation for forecast runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag a caller flips to stop a forecast.
///
/// Checked before each trial starts; a trial that is already running
/// finishes normally.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
