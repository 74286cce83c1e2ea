//! Cooperative pause for the polling loops.
//!
//! Loops call [`PauseGate::wait_resumed`] at the top of every cycle and
//! before each instance. Senders hold a [`PauseGuard`] for the duration of a
//! single outbound send; dropping the guard resumes polling on every exit
//! path.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct PauseGate {
    holders: Arc<watch::Sender<usize>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            holders: Arc::new(tx),
        }
    }

    /// Pause until the returned guard is dropped.
    pub fn pause(&self) -> PauseGuard {
        self.acquire();
        PauseGuard { gate: self.clone() }
    }

    /// Unscoped pause. Must be paired with [`PauseGate::release`].
    pub fn acquire(&self) {
        self.holders.send_modify(|n| *n += 1);
    }

    pub fn release(&self) {
        self.holders.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn is_paused(&self) -> bool {
        *self.holders.borrow() > 0
    }

    /// Resolve once no pause is held.
    pub async fn wait_resumed(&self) {
        let mut rx = self.holders.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Releases its pause on drop.
#[must_use = "polling resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    gate: PauseGate,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
