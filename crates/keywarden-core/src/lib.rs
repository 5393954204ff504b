mod authority;
mod gateway;
mod interaction;
mod registry;

pub use authority::{
    AuthorityReply, HashAlgorithm, InteractionHandle, InteractionProof, KeyRef, NullAuthority,
    SignAttempt, SigningAuthority,
};
pub use gateway::{ApprovalPrompt, LogPrompt, SigningGateway};
pub use interaction::{interaction_slot, InteractionOutcome, InteractionSender, InteractionSlot};
pub use registry::{Identity, IdentityRegistry, SelectedKey};

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("key not found")]
    KeyNotFound,
    #[error("signing denied by authority")]
    Denied,
    #[error("user interaction timed out")]
    InteractionTimeout,
    #[error("user interaction cancelled")]
    InteractionCancelled,
    #[error("signing authority unavailable: {0}")]
    AuthorityUnavailable(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, CoreError>;
