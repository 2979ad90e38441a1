//! Broadcast stop signal shared by every runtime task.
//!
//! Each loop and background task observes the signal at its next cooperative
//! boundary (tick, channel operation, or handler return); in-flight handler
//! invocations are never interrupted mid-call.

use tokio::sync::watch;

/// A one-way, idempotent shutdown signal.
///
/// Cloning is cheap; all clones share the same underlying channel. Signalling
/// twice is a no-op.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Trip the signal. Idempotent.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been tripped.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe a watcher for use in `select!` arms.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal trips. Returns immediately if already tripped.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            // The sender half lives in self, so changed() cannot fail here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());

        stop.signal();
        stop.signal();
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_signal() {
        let stop = StopSignal::new();
        let waiter = stop.clone();

        let handle = tokio::spawn(async move { waiter.stopped().await });
        stop.signal();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stopped() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_resolves_if_already_signalled() {
        let stop = StopSignal::new();
        stop.signal();

        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .expect("stopped() should resolve immediately");
    }
}
