use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{PayloadBuilder, PayloadReader};
use crate::{
    AgentMessage, AgentRequest, AgentResponse, ProtoError, Result, SSH_AGENTC_EXTENSION,
    SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENTC_SIGN_REQUEST, SSH_AGENT_EXTENSION_FAILURE,
    SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SIGN_RESPONSE, SSH_AGENT_SUCCESS,
};

pub const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MiB

/// Reads one framed message. Returns `Ok(None)` on a clean end of stream
/// before the first byte of a frame; an end of stream anywhere inside a
/// frame is `ProtoError::UnexpectedEof`.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<AgentMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut off = 0;
    while off < len_buf.len() {
        let n = reader.read(&mut len_buf[off..]).await?;
        if n == 0 {
            if off == 0 {
                return Ok(None);
            }
            return Err(ProtoError::UnexpectedEof);
        }
        off += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtoError::InvalidMessage("frame has no type byte"));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::UnexpectedEof
        } else {
            ProtoError::Io(err)
        }
    })?;

    let message_type = frame[0];
    let payload = Bytes::from(frame).slice(1..);
    Ok(Some(AgentMessage::new(message_type, payload)))
}

/// Writes one framed message as a single buffer and flushes. The frame cap
/// applies on both directions, so a peer holding the same limit can always
/// read what we emit.
pub async fn write_message<W>(writer: &mut W, message: &AgentMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if 1 + message.payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(1 + message.payload.len()));
    }
    let mut buf = BytesMut::with_capacity(5 + message.payload.len());
    buf.put_u32(1 + message.payload.len() as u32);
    buf.put_u8(message.message_type);
    buf.put_slice(&message.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub fn decode_request(message: &AgentMessage) -> Result<AgentRequest> {
    match message.message_type {
        SSH_AGENTC_REQUEST_IDENTITIES => Ok(AgentRequest::RequestIdentities),
        SSH_AGENTC_SIGN_REQUEST => {
            let mut reader = PayloadReader::for_message(message);
            let key_blob = reader.get_bytes()?;
            let data = reader.get_bytes()?;
            let flags = reader.get_u32()?;
            Ok(AgentRequest::Sign {
                key_blob,
                data,
                flags,
            })
        }
        SSH_AGENTC_EXTENSION => Ok(AgentRequest::Extension {
            payload: message.payload.clone(),
        }),
        other => Ok(AgentRequest::Unknown {
            message_type: other,
        }),
    }
}

pub fn encode_response(response: &AgentResponse) -> AgentMessage {
    match response {
        AgentResponse::Failure => AgentMessage::empty(SSH_AGENT_FAILURE),
        AgentResponse::Success => AgentMessage::empty(SSH_AGENT_SUCCESS),
        AgentResponse::ExtensionFailure => AgentMessage::empty(SSH_AGENT_EXTENSION_FAILURE),
        AgentResponse::Identities(identities) => {
            let mut builder = PayloadBuilder::new();
            builder.put_u32(identities.len() as u32);
            for identity in identities {
                builder.put_bytes(&identity.key_blob);
                builder.put_string(&identity.comment);
            }
            builder.into_message(SSH_AGENT_IDENTITIES_ANSWER)
        }
        AgentResponse::Signature(signature) => {
            let mut builder = PayloadBuilder::new();
            builder.put_bytes(signature);
            builder.into_message(SSH_AGENT_SIGN_RESPONSE)
        }
    }
}
