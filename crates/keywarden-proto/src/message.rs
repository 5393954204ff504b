use bytes::Bytes;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_EXTENSION: u8 = 27;
pub const SSH_AGENT_EXTENSION_FAILURE: u8 = 28;

pub const SSH_AGENT_RSA_SHA2_256: u32 = 2;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 4;

/// One framed agent message: a type byte plus an opaque payload.
///
/// On the wire this is preceded by a 4-byte big-endian length covering
/// the type byte and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub message_type: u8,
    pub payload: Bytes,
}

impl AgentMessage {
    pub fn new(message_type: u8, payload: Bytes) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn empty(message_type: u8) -> Self {
        Self {
            message_type,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub enum AgentRequest {
    RequestIdentities,
    Sign {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    Extension {
        payload: Bytes,
    },
    Unknown {
        message_type: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Failure,
    Success,
    Identities(Vec<Identity>),
    Signature(Vec<u8>),
    ExtensionFailure,
}
