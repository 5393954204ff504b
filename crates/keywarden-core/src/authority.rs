use async_trait::async_trait;

use keywarden_proto::{SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512};

use crate::{CoreError, Result};

/// Opaque handle naming one key held by the external custodian. The bridge
/// never sees key material, only this reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct KeyRef(pub String);

impl std::fmt::Display for KeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Maps sign-request flag bits to a hash selector. 0x04 wins over 0x02;
    /// with neither bit set the protocol default of SHA-1 applies.
    pub fn from_sign_flags(flags: u32) -> Self {
        if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
            HashAlgorithm::Sha512
        } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Sha1
        }
    }
}

/// Token the authority hands out when a sign attempt needs user approval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractionHandle(pub Vec<u8>);

/// Proof that the out-of-process approval flow completed; attached to the
/// resubmitted attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractionProof(pub Vec<u8>);

#[derive(Clone, Debug)]
pub struct SignAttempt {
    pub key_ref: KeyRef,
    pub data: Vec<u8>,
    pub hash: HashAlgorithm,
    pub proof: Option<InteractionProof>,
}

#[derive(Debug)]
pub enum AuthorityReply {
    Signature(Vec<u8>),
    InteractionRequired(InteractionHandle),
    Denied,
}

/// Capability surface of the external signing authority. The authority is a
/// shared singleton that does not tolerate concurrent calls; callers go
/// through the `SigningGateway`, which serializes access.
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    async fn fetch_public_key(&self, key_ref: &KeyRef) -> Result<Vec<u8>>;
    async fn sign(&self, attempt: &SignAttempt) -> Result<AuthorityReply>;
}

/// Authority with no keys. Stands in until a real custodian binding is wired.
pub struct NullAuthority;

#[async_trait]
impl SigningAuthority for NullAuthority {
    async fn fetch_public_key(&self, _key_ref: &KeyRef) -> Result<Vec<u8>> {
        Err(CoreError::KeyNotFound)
    }

    async fn sign(&self, _attempt: &SignAttempt) -> Result<AuthorityReply> {
        Err(CoreError::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_flags_select_hash() {
        assert_eq!(HashAlgorithm::from_sign_flags(0), HashAlgorithm::Sha1);
        assert_eq!(
            HashAlgorithm::from_sign_flags(SSH_AGENT_RSA_SHA2_256),
            HashAlgorithm::Sha256
        );
        assert_eq!(
            HashAlgorithm::from_sign_flags(SSH_AGENT_RSA_SHA2_512),
            HashAlgorithm::Sha512
        );
        assert_eq!(
            HashAlgorithm::from_sign_flags(SSH_AGENT_RSA_SHA2_256 | SSH_AGENT_RSA_SHA2_512),
            HashAlgorithm::Sha512
        );
        // Unrelated bits do not select anything.
        assert_eq!(HashAlgorithm::from_sign_flags(1), HashAlgorithm::Sha1);
    }
}
