use std::sync::Arc;

use keywarden_core::{
    HashAlgorithm, IdentityRegistry, InteractionSlot, SelectedKey, SigningGateway,
};
use keywarden_proto::{
    decode_request, encode_response, read_message, write_message, AgentMessage, AgentRequest,
    AgentResponse, Identity,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::Result;

const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a session needs beyond its stream.
pub struct SessionContext {
    pub gateway: Arc<SigningGateway>,
    pub selected_keys: Arc<Vec<SelectedKey>>,
    pub port: u16,
}

/// One agent-protocol session: reads a message, dispatches it, writes exactly
/// one response, strictly in sequence. The identity registry is loaded on
/// first need, whichever request type needs it first, and cached until the
/// session ends.
pub struct Session {
    ctx: SessionContext,
    slot: InteractionSlot,
    registry: Option<IdentityRegistry>,
}

impl Session {
    pub fn new(ctx: SessionContext, slot: InteractionSlot) -> Self {
        Self {
            ctx,
            slot,
            registry: None,
        }
    }

    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let port = self.ctx.port;
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            let message = match timeout(IDLE_READ_TIMEOUT, read_message(&mut reader)).await {
                Err(_) => {
                    info!(port, "idle timeout, closing session");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(port, "client closed the stream");
                    break;
                }
                Ok(Ok(Some(message))) => message,
                Ok(Err(err)) => {
                    warn!(port, %err, "failed to read request");
                    return Err(err.into());
                }
            };

            let response = self.dispatch(&message).await;
            write_message(&mut writer, &encode_response(&response)).await?;
        }

        Ok(())
    }

    async fn dispatch(&mut self, message: &AgentMessage) -> AgentResponse {
        let port = self.ctx.port;
        let request = match decode_request(message) {
            Ok(request) => request,
            Err(err) => {
                warn!(port, message_type = message.message_type, %err, "malformed request");
                return AgentResponse::Failure;
            }
        };

        match request {
            AgentRequest::RequestIdentities => {
                let identities = self
                    .registry()
                    .await
                    .identities()
                    .iter()
                    .map(|identity| Identity {
                        key_blob: identity.key_blob.clone(),
                        comment: identity.comment.clone(),
                    })
                    .collect();
                AgentResponse::Identities(identities)
            }
            AgentRequest::Sign {
                key_blob,
                data,
                flags,
            } => self.handle_sign(key_blob, data, flags).await,
            AgentRequest::Extension { .. } => {
                // No extensions are implemented.
                AgentResponse::ExtensionFailure
            }
            AgentRequest::Unknown { message_type } => {
                warn!(port, message_type, "unsupported request type");
                AgentResponse::Failure
            }
        }
    }

    async fn handle_sign(&mut self, key_blob: Vec<u8>, data: Vec<u8>, flags: u32) -> AgentResponse {
        let port = self.ctx.port;

        let key_ref = match self.registry().await.find_by_blob(&key_blob) {
            Some(identity) => identity.key_ref.clone(),
            None => {
                warn!(port, "sign request for a key not in the registry");
                return AgentResponse::Failure;
            }
        };

        let hash = HashAlgorithm::from_sign_flags(flags);
        match self
            .ctx
            .gateway
            .sign(port, &mut self.slot, &key_ref, &data, hash)
            .await
        {
            Ok(signature) => AgentResponse::Signature(signature),
            Err(err) => {
                warn!(port, key_ref = %key_ref, %err, "sign request failed");
                AgentResponse::Failure
            }
        }
    }

    async fn registry(&mut self) -> &IdentityRegistry {
        if self.registry.is_none() {
            let authority = self.ctx.gateway.authority().clone();
            let loaded =
                IdentityRegistry::load(authority.as_ref(), &self.ctx.selected_keys).await;
            info!(
                port = self.ctx.port,
                identities = loaded.len(),
                "loaded identity registry"
            );
            self.registry = Some(loaded);
        }
        self.registry.get_or_insert_with(IdentityRegistry::empty)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use keywarden_core::{
        interaction_slot, AuthorityReply, CoreError, KeyRef, LogPrompt, NullAuthority,
        SignAttempt, SigningAuthority,
    };
    use keywarden_proto::{
        PayloadBuilder, PayloadReader, SSH_AGENTC_EXTENSION, SSH_AGENTC_REQUEST_IDENTITIES,
        SSH_AGENTC_SIGN_REQUEST, SSH_AGENT_EXTENSION_FAILURE, SSH_AGENT_FAILURE,
        SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SIGN_RESPONSE,
    };
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    /// One resolvable key; signs by echoing the challenge reversed. Denies
    /// when asked for anything else.
    struct OneKeyAuthority;

    const BLOB: &[u8] = b"ssh-ed25519 blob";

    #[async_trait]
    impl SigningAuthority for OneKeyAuthority {
        async fn fetch_public_key(
            &self,
            key_ref: &KeyRef,
        ) -> keywarden_core::Result<Vec<u8>> {
            if key_ref.0 == "k1" {
                Ok(BLOB.to_vec())
            } else {
                Err(CoreError::KeyNotFound)
            }
        }

        async fn sign(&self, attempt: &SignAttempt) -> keywarden_core::Result<AuthorityReply> {
            let mut signature = attempt.data.clone();
            signature.reverse();
            Ok(AuthorityReply::Signature(signature))
        }
    }

    fn context(authority: Arc<dyn SigningAuthority>, keys: Vec<SelectedKey>) -> SessionContext {
        SessionContext {
            gateway: Arc::new(SigningGateway::new(authority, Arc::new(LogPrompt))),
            selected_keys: Arc::new(keys),
            port: 7,
        }
    }

    fn selected(key_ref: &str, name: &str) -> SelectedKey {
        SelectedKey {
            key_ref: KeyRef(key_ref.into()),
            name: name.into(),
        }
    }

    async fn start_session(ctx: SessionContext) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_sender, slot) = interaction_slot();
        tokio::spawn(async move {
            let _ = Session::new(ctx, slot).run(server).await;
        });
        client
    }

    async fn exchange(client: &mut DuplexStream, request: AgentMessage) -> AgentMessage {
        write_message(client, &request).await.unwrap();
        read_message(client).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn empty_registry_answers_zero_identities() {
        let mut client = start_session(context(Arc::new(NullAuthority), Vec::new())).await;

        let reply = exchange(
            &mut client,
            AgentMessage::empty(SSH_AGENTC_REQUEST_IDENTITIES),
        )
        .await;

        assert_eq!(reply.message_type, SSH_AGENT_IDENTITIES_ANSWER);
        assert_eq!(reply.payload.as_ref(), &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn identities_include_resolved_keys_only() {
        let ctx = context(
            Arc::new(OneKeyAuthority),
            vec![selected("k1", "laptop"), selected("missing", "gone")],
        );
        let mut client = start_session(ctx).await;

        let reply = exchange(
            &mut client,
            AgentMessage::empty(SSH_AGENTC_REQUEST_IDENTITIES),
        )
        .await;

        let mut reader = PayloadReader::for_message(&reply);
        assert_eq!(reader.get_u32().unwrap(), 1);
        assert_eq!(reader.get_bytes().unwrap(), BLOB);
        assert_eq!(reader.get_string().unwrap(), "laptop");
    }

    #[tokio::test]
    async fn sign_request_round_trip() {
        let ctx = context(Arc::new(OneKeyAuthority), vec![selected("k1", "laptop")]);
        let mut client = start_session(ctx).await;

        let mut builder = PayloadBuilder::new();
        builder.put_bytes(BLOB).put_bytes(b"abc").put_u32(0);
        let reply = exchange(&mut client, builder.into_message(SSH_AGENTC_SIGN_REQUEST)).await;

        assert_eq!(reply.message_type, SSH_AGENT_SIGN_RESPONSE);
        let mut reader = PayloadReader::for_message(&reply);
        assert_eq!(reader.get_bytes().unwrap(), b"cba");
    }

    #[tokio::test]
    async fn sign_for_unknown_blob_is_failure_and_session_survives() {
        let ctx = context(Arc::new(OneKeyAuthority), vec![selected("k1", "laptop")]);
        let mut client = start_session(ctx).await;

        let mut builder = PayloadBuilder::new();
        builder.put_bytes(b"not registered").put_bytes(b"abc").put_u32(0);
        let reply = exchange(&mut client, builder.into_message(SSH_AGENTC_SIGN_REQUEST)).await;
        assert_eq!(reply.message_type, SSH_AGENT_FAILURE);
        assert!(reply.payload.is_empty());

        // Next request on the same session still works.
        let reply = exchange(
            &mut client,
            AgentMessage::empty(SSH_AGENTC_REQUEST_IDENTITIES),
        )
        .await;
        assert_eq!(reply.message_type, SSH_AGENT_IDENTITIES_ANSWER);
    }

    #[tokio::test]
    async fn extension_requests_get_extension_failure() {
        let mut client = start_session(context(Arc::new(NullAuthority), Vec::new())).await;

        let reply = exchange(&mut client, AgentMessage::empty(SSH_AGENTC_EXTENSION)).await;
        assert_eq!(reply.message_type, SSH_AGENT_EXTENSION_FAILURE);
    }

    #[tokio::test]
    async fn unknown_message_type_is_failure() {
        let mut client = start_session(context(Arc::new(NullAuthority), Vec::new())).await;

        let reply = exchange(&mut client, AgentMessage::empty(99)).await;
        assert_eq!(reply.message_type, SSH_AGENT_FAILURE);
    }

    #[tokio::test]
    async fn truncated_sign_request_degrades_to_failure() {
        let ctx = context(Arc::new(OneKeyAuthority), vec![selected("k1", "laptop")]);
        let mut client = start_session(ctx).await;

        let mut builder = PayloadBuilder::new();
        builder.put_bytes(BLOB); // missing data and flags
        let reply = exchange(&mut client, builder.into_message(SSH_AGENTC_SIGN_REQUEST)).await;
        assert_eq!(reply.message_type, SSH_AGENT_FAILURE);
    }

    #[tokio::test]
    async fn unanswered_approval_times_out_but_session_stays_open() {
        /// Resolves one key but always demands interaction before signing.
        struct StubbornAuthority;

        #[async_trait]
        impl SigningAuthority for StubbornAuthority {
            async fn fetch_public_key(
                &self,
                _key_ref: &KeyRef,
            ) -> keywarden_core::Result<Vec<u8>> {
                Ok(BLOB.to_vec())
            }

            async fn sign(
                &self,
                _attempt: &SignAttempt,
            ) -> keywarden_core::Result<AuthorityReply> {
                Ok(AuthorityReply::InteractionRequired(
                    keywarden_core::InteractionHandle(b"pending".to_vec()),
                ))
            }
        }

        let gateway = SigningGateway::new(Arc::new(StubbornAuthority), Arc::new(LogPrompt))
            .with_interaction_timeout(Duration::from_millis(20));
        let ctx = SessionContext {
            gateway: Arc::new(gateway),
            selected_keys: Arc::new(vec![selected("k1", "laptop")]),
            port: 7,
        };
        let mut client = start_session(ctx).await;

        let mut builder = PayloadBuilder::new();
        builder.put_bytes(BLOB).put_bytes(b"abc").put_u32(0);
        let reply = exchange(&mut client, builder.into_message(SSH_AGENTC_SIGN_REQUEST)).await;
        assert_eq!(reply.message_type, SSH_AGENT_FAILURE);

        let reply = exchange(
            &mut client,
            AgentMessage::empty(SSH_AGENTC_REQUEST_IDENTITIES),
        )
        .await;
        assert_eq!(reply.message_type, SSH_AGENT_IDENTITIES_ANSWER);
    }

    #[tokio::test]
    async fn clean_shutdown_on_client_close() {
        let ctx = context(Arc::new(NullAuthority), Vec::new());
        let (client, server) = tokio::io::duplex(1024);
        let (_sender, slot) = interaction_slot();
        let session = tokio::spawn(async move { Session::new(ctx, slot).run(server).await });

        let mut client = client;
        client.shutdown().await.unwrap();
        drop(client);

        assert!(session.await.unwrap().is_ok());
    }
}
