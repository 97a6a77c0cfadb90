//! Pipeline-wide abort signal.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::info;

/// Shared abort flag watched by every in-flight unit.
///
/// Only the first reason is kept. Units parked in [`cancelled`] wake up and
/// withdraw their backend submissions; later stages refuse to start.
///
/// [`cancelled`]: CancellationToken::cancelled
#[derive(Default)]
pub struct CancellationToken {
    reason: Mutex<Option<String>>,
    // Set after `reason`, so a reader that sees the flag also sees a reason.
    fired: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Creates an unfired token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Returns false if it had already fired.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        let reason = reason.into();
        info!(reason = %reason, "Pipeline cancelled");
        *slot = Some(reason);
        self.fired.store(true, Ordering::Release);
        drop(slot);

        self.notify.notify_waiters();
        true
    }

    /// Returns whether the token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Returns the first cancellation reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Completes once the token has fired.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_unfired_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_only_first_cancel_counts() {
        let token = CancellationToken::new();
        assert!(token.cancel("disk quota exceeded"));
        assert!(!token.cancel("operator abort"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("disk quota exceeded"));
    }

    #[tokio::test]
    async fn test_cancel_wakes_spawned_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_cancelled_pending_until_cancel() {
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("stop");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_cancelled_ready_when_already_fired() {
        let token = CancellationToken::new();
        token.cancel("done");
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_ready!(waiter.poll());
    }
}
