//! Cancellation Signal
//!
//! A clonable interrupt token observable at loop-iteration boundaries and
//! inside sandbox execution. Cancelling is idempotent and sticky.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// Shared cancellation token.
///
/// Clones observe the same underlying flag, so a parent loop can hand the
/// token to a sandbox session or a managed sub-agent and interrupt both with
/// a single `cancel()`.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            // Re-check after registering the waiter: notify_waiters only
            // wakes tasks already waiting.
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
