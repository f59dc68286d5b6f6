//! Shutdown Signal
//!
//! A one-shot, many-listener signal. Every receive loop holds a listener and
//! selects on it next to its transport read.

use std::sync::Arc;

use tokio::sync::watch;

/// Trigger side of the shutdown signal
///
/// Clones trigger the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create an untriggered signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Get a listener for this signal
    #[must_use]
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Listening side of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Wait until the signal fires
    ///
    /// Resolves immediately if it already has. Never resolves if every
    /// `Shutdown` handle is dropped without triggering.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();

        let waiter = tokio::spawn(async move { listener.triggered().await });
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_late_listener_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        let mut listener = shutdown.listener();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), listener.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_signal_never_fires() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        drop(shutdown);

        let result = tokio::time::timeout(Duration::from_millis(50), listener.triggered()).await;
        assert!(result.is_err());
    }
}
