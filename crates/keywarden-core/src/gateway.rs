use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{
    AuthorityReply, CoreError, HashAlgorithm, InteractionHandle, InteractionOutcome,
    InteractionSlot, KeyRef, Result, SignAttempt, SigningAuthority,
};

const INTERACTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Fire-and-forget surface to whatever can show the user an approval flow.
/// The outcome comes back asynchronously through the worker's interaction
/// slot, not through this trait.
pub trait ApprovalPrompt: Send + Sync {
    fn request_approval(&self, port: u16, handle: &InteractionHandle);
}

/// Prompt of last resort: records that approval was needed and nothing more.
/// Escalations will time out unless a real surface is wired.
pub struct LogPrompt;

impl ApprovalPrompt for LogPrompt {
    fn request_approval(&self, port: u16, _handle: &InteractionHandle) {
        warn!(port, "signing requires user approval but no approval surface is wired");
    }
}

/// Serializes all access to the signing authority and drives the
/// user-interaction escalation exchange.
pub struct SigningGateway {
    authority: Arc<dyn SigningAuthority>,
    prompt: Arc<dyn ApprovalPrompt>,
    // The authority accepts one in-flight request at a time, process-wide.
    authority_lock: Mutex<()>,
    interaction_timeout: Duration,
}

impl SigningGateway {
    pub fn new(authority: Arc<dyn SigningAuthority>, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        Self {
            authority,
            prompt,
            authority_lock: Mutex::new(()),
            interaction_timeout: INTERACTION_TIMEOUT,
        }
    }

    pub fn with_interaction_timeout(mut self, interaction_timeout: Duration) -> Self {
        self.interaction_timeout = interaction_timeout;
        self
    }

    pub fn authority(&self) -> &Arc<dyn SigningAuthority> {
        &self.authority
    }

    /// Signs `data` with the custodian key behind `key_ref`. Holds the
    /// authority lock for the whole exchange, including any approval round
    /// trips, so a second session queues rather than interleaving.
    pub async fn sign(
        &self,
        port: u16,
        slot: &mut InteractionSlot,
        key_ref: &KeyRef,
        data: &[u8],
        hash: HashAlgorithm,
    ) -> Result<Vec<u8>> {
        let mut attempt = SignAttempt {
            key_ref: key_ref.clone(),
            data: data.to_vec(),
            hash,
            proof: None,
        };

        let _guard = self.authority_lock.lock().await;
        loop {
            match self.authority.sign(&attempt).await? {
                AuthorityReply::Signature(signature) => return Ok(signature),
                AuthorityReply::Denied => return Err(CoreError::Denied),
                AuthorityReply::InteractionRequired(handle) => {
                    debug!(port, key_ref = %key_ref, "authority requires user interaction");
                    self.prompt.request_approval(port, &handle);
                    match slot.wait(self.interaction_timeout).await? {
                        InteractionOutcome::Completed(proof) => {
                            attempt.proof = Some(proof);
                        }
                        InteractionOutcome::Cancelled => {
                            return Err(CoreError::InteractionCancelled)
                        }
                    }
                }
            }
        }
    }
}
