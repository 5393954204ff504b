mod codec;
mod message;
mod wire;

pub use codec::{decode_request, encode_response, read_message, write_message, MAX_FRAME_LEN};
pub use message::{
    AgentMessage, AgentRequest, AgentResponse, Identity, SSH_AGENTC_EXTENSION,
    SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENTC_SIGN_REQUEST, SSH_AGENT_EXTENSION_FAILURE,
    SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_RSA_SHA2_256,
    SSH_AGENT_RSA_SHA2_512, SSH_AGENT_SIGN_RESPONSE, SSH_AGENT_SUCCESS,
};
pub use wire::{PayloadBuilder, PayloadReader};

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
