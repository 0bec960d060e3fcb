//! Single-flight gate for conversation turns.
//!
//! A session owns one gate. Final utterances race for its only permit;
//! the winner carries the permit through the whole turn and releases it
//! by dropping it once playback is over.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Held for the duration of one turn.
pub type TurnPermit = OwnedSemaphorePermit;

#[derive(Clone)]
pub struct TurnGate {
    semaphore: Arc<Semaphore>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the in-flight turn to finish. Returns `None` once the gate
    /// has been closed.
    pub async fn acquire(&self) -> Option<TurnPermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Take the permit only if no turn is in flight.
    pub fn try_acquire(&self) -> Option<TurnPermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Refuse all future turns. Permits already handed out stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Default for TurnGate {
    fn default() -> Self {
        Self::new()
    }
}
