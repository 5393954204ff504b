use tracing::warn;

use crate::{KeyRef, SigningAuthority};

/// One key the user selected for exposure over the agent protocol.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SelectedKey {
    pub key_ref: KeyRef,
    pub name: String,
}

/// A selectable identity: the exact SSH-wire public key blob plus its label
/// and the custodian reference behind it.
#[derive(Clone, Debug)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
    pub key_ref: KeyRef,
}

/// Ordered list of identities resolved from the authority for one session.
/// Loaded lazily on first need and cached for the session's lifetime.
pub struct IdentityRegistry {
    identities: Vec<Identity>,
}

impl IdentityRegistry {
    pub fn empty() -> Self {
        Self {
            identities: Vec::new(),
        }
    }

    /// Resolves each selected key through the authority, preserving selection
    /// order. Keys that fail to resolve are skipped, not fatal.
    pub async fn load(authority: &dyn SigningAuthority, selected: &[SelectedKey]) -> Self {
        let mut identities = Vec::with_capacity(selected.len());
        for key in selected {
            match authority.fetch_public_key(&key.key_ref).await {
                Ok(key_blob) => identities.push(Identity {
                    key_blob,
                    comment: key.name.clone(),
                    key_ref: key.key_ref.clone(),
                }),
                Err(err) => {
                    warn!(key_ref = %key.key_ref, %err, "skipping key that failed to resolve");
                }
            }
        }
        Self { identities }
    }

    /// Byte-exact scan in registration order. Identity counts are small
    /// user-curated lists, so O(n) is fine.
    pub fn find_by_blob(&self, target: &[u8]) -> Option<&Identity> {
        self.identities
            .iter()
            .find(|identity| identity.key_blob == target)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
