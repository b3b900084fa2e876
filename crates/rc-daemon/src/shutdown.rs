//! Process-wide shutdown coordination.
//!
//! The signal is level-triggered: a task that starts waiting after
//! [`ShutdownSignal::trigger`] returns immediately. Components that must
//! finish work before the process exits hold a [`ShutdownGuard`]; the daemon
//! waits for every guard to drop, with a deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            state: Arc::new(state),
            drained: Arc::new(drained),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.borrow()
    }

    /// Request shutdown. Later calls are no-ops.
    pub fn trigger(&self) {
        if self.state.send_if_modified(|down| !std::mem::replace(down, true)) {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolve once shutdown has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// A guard that counts as drained when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    pub fn confirm_drained(&self) {
        self.drained.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` components confirmed, or until `timeout`.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .map(|res| res.is_ok());
        let confirmed = *rx.borrow();
        match outcome {
            Ok(_) => {
                info!(confirmed, "all components drained");
                DrainResult::Complete(confirmed)
            }
            Err(_) => {
                warn!(confirmed, expected, "drain timed out");
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Confirms drain when dropped.
#[derive(Debug)]
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}
