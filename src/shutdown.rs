//! Shutdown and cancellation for node workers.
//!
//! A [`ShutdownController`] fans a single stop signal out to every worker.
//! Workers hold a [`CancelSignal`] and either poll it between units of work
//! (the proof-of-work search does) or `select!` on [`CancelSignal::cancelled`]
//! around blocking waits.

use tokio::signal;
use tokio::sync::watch;

pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Get a signal that flips once shutdown is triggered.
    pub fn subscribe(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => { tracing::info!("received SIGINT, shutting down"); }
            _ = terminate => { tracing::info!("received SIGTERM, shutting down"); }
        }

        self.shutdown();
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown is triggered. Pends forever if the controller
    /// is dropped without triggering.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn programmatic_shutdown_notifies_subscribers() {
        let controller = ShutdownController::new();
        let first = controller.subscribe();
        let second = first.clone();
        assert!(!first.is_cancelled());

        controller.shutdown();
        timeout(Duration::from_secs(1), first.cancelled())
            .await
            .expect("first subscriber not notified");
        timeout(Duration::from_secs(1), second.cancelled())
            .await
            .expect("second subscriber not notified");
        assert!(second.is_cancelled());
        assert!(controller.is_shutdown());
    }

    #[tokio::test]
    async fn late_subscriber_sees_earlier_shutdown() {
        let controller = ShutdownController::new();
        controller.shutdown();
        let late = controller.subscribe();
        assert!(late.is_cancelled());
        timeout(Duration::from_secs(1), late.cancelled())
            .await
            .expect("late subscriber not notified");
    }

    #[tokio::test]
    async fn never_signal_stays_pending() {
        let never = CancelSignal::never();
        assert!(!never.is_cancelled());
        assert!(timeout(Duration::from_millis(50), never.cancelled()).await.is_err());
    }
}
