//! Cooperative cancellation shared by the LLM client and the consolidation
//! engine.
//!
//! A single [`AbortHandle`] fans out to any number of cloned [`AbortSignal`]s.
//! Abort is one-way and sticky: once triggered it can never be un-triggered,
//! so a signal observed as aborted stays aborted.

use std::time::Duration;

use tokio::sync::watch;

/// Owner side of the abort channel. Dropping the handle does NOT abort;
/// outstanding signals simply never fire.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Cloneable observer side, checked at every suspension point.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortHandle {
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires, for callers without cancellation needs.
    pub fn never() -> Self {
        static NEVER_TX: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER_TX.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when abort fires. Never resolves on a [`never`] signal.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without aborting: park forever.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`, waking early if abort fires.
    ///
    /// Returns `true` if the full duration elapsed, `false` on abort.
    pub async fn sleep_unless_aborted(&self, duration: Duration) -> bool {
        if self.is_aborted() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}
