use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::{CoreError, InteractionProof, Result};

/// Result of one user-approval round trip.
#[derive(Debug)]
pub enum InteractionOutcome {
    Completed(InteractionProof),
    Cancelled,
}

/// Single-slot handoff for interaction results: capacity 1, consumed once.
/// Delivering before anyone waits pre-fills the slot; delivering into a full
/// slot drops the result.
pub fn interaction_slot() -> (InteractionSender, InteractionSlot) {
    let (tx, rx) = mpsc::channel(1);
    (InteractionSender(tx), InteractionSlot(rx))
}

#[derive(Clone)]
pub struct InteractionSender(mpsc::Sender<InteractionOutcome>);

impl InteractionSender {
    /// Never blocks. Returns false when the slot is already full or the
    /// worker is gone.
    pub fn deliver(&self, outcome: InteractionOutcome) -> bool {
        self.0.try_send(outcome).is_ok()
    }
}

pub struct InteractionSlot(mpsc::Receiver<InteractionOutcome>);

impl InteractionSlot {
    /// Waits for the next delivered outcome, bounded by `wait_for`. A closed
    /// slot (worker torn down mid-wait) counts as a cancellation.
    pub async fn wait(&mut self, wait_for: Duration) -> Result<InteractionOutcome> {
        match timeout(wait_for, self.0.recv()).await {
            Err(_) => Err(CoreError::InteractionTimeout),
            Ok(None) => Err(CoreError::InteractionCancelled),
            Ok(Some(outcome)) => Ok(outcome),
        }
    }
}
