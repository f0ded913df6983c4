//! Cooperative stop signal for worker tasks.
//!
//! A [`StopSignal`] is held by whoever may ask a worker to stop; each worker
//! holds a [`StopListener`] and checks it between blocking operations.
//! Backed by a `watch` channel, so a trigger that happens before the worker
//! starts waiting is never lost.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::watch;

// ============================================================================
// StopSignal
// ============================================================================

/// Triggering side of a stop signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once triggered.
    #[inline]
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Creates a listener for a worker.
    #[must_use]
    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

// ============================================================================
// StopListener
// ============================================================================

/// Observing side of a stop signal.
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Returns `true` once the signal was triggered.
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when the signal is triggered or every trigger handle is gone.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_before_wait_is_observed() {
        let signal = StopSignal::new();
        let mut listener = signal.listener();
        signal.trigger();

        assert!(listener.is_stopped());
        tokio::time::timeout(Duration::from_millis(100), listener.stopped())
            .await
            .expect("stopped() should complete immediately");
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let signal = StopSignal::new();
        let mut listener = signal.listener();

        let waiter = tokio::spawn(async move { listener.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_triggered());

        signal.trigger();
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert!(signal.is_triggered());
    }
}
