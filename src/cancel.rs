//! Cooperative cancellation signal.
//!
//! One [`CancelHandle`] fans out to any number of cloned [`CancelToken`]s.
//! Waiters built on `tokio::sync::watch` wake as soon as the handle fires,
//! which keeps the gateway and cache inside the 100 ms observation window.

use tokio::sync::watch;

/// Sending side of the cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the signal. All tokens observe it; firing twice is a no-op.
    pub fn cancel(&self) {
        // Receivers only ever observe the true state.
        let _ = self.tx.send(true);
    }
}

/// Receiving side of the cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a connected handle/token pair.
    #[must_use]
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// Returns a token that never fires, for callers without a driver.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open forever so waiters park instead of erroring.
        std::mem::forget(tx);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. If the handle is dropped
    /// without firing, the future pends forever.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
