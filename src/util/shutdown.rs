//! Run-wide stop signal shared by every engine component.
//!
//! A graceful stop lets in-flight extractions finish and still writes the
//! final checkpoint. A hard interrupt additionally skips that write: the
//! last periodic checkpoint stays on disk untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Cloneable stop signal handed to components at construction.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    hard: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a fresh, un-triggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that stops when this one does but can also be stopped on its
    /// own without affecting the parent. Shares the hard-interrupt flag.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            hard: Arc::clone(&self.hard),
        }
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Request a hard interrupt (implies stop).
    pub fn interrupt(&self) {
        self.hard.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// Whether any stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the stop was a hard interrupt.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.hard.load(Ordering::Acquire)
    }

    /// Underlying token, for async callers that want to `select!` on it.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
