//! Graceful worker-pool shutdown, shared between the downloader and the batch
//! prepare fan-out (spec.md §5 "Global shutdown drains worker pools gracefully").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// A process-wide flag plus [`CancellationToken`], checked by dispatcher loops before
/// accepting new work and handed to in-flight tasks so they can cancel cooperatively.
#[derive(Clone)]
pub struct ShutdownGuard {
    shutting_down: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self {
            shutting_down: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Marks the guard as shutting down and cancels every outstanding token derived
    /// from it. Idempotent.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.token.cancel();
    }
}
