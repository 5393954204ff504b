use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AgentMessage, ProtoError, Result, MAX_FRAME_LEN};

/// Appends typed agent-protocol fields to an in-memory payload.
///
/// All integers are 4-byte big-endian; strings and byte blobs carry a
/// 4-byte length prefix.
#[derive(Default)]
pub struct PayloadBuilder {
    buf: BytesMut,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn into_message(self, message_type: u8) -> AgentMessage {
        AgentMessage::new(message_type, self.buf.freeze())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Extracts typed fields from a payload in the order they were written.
///
/// Every accessor fails with `ProtoError::UnexpectedEof` once the payload
/// runs out instead of panicking.
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    pub fn for_message(message: &AgentMessage) -> Self {
        Self::new(message.payload.clone())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        if !self.buf.has_remaining() {
            return Err(ProtoError::UnexpectedEof);
        }
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(ProtoError::UnexpectedEof);
        }
        Ok(self.buf.get_u32())
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge(len));
        }
        if self.buf.remaining() < len {
            return Err(ProtoError::UnexpectedEof);
        }
        Ok(self.buf.copy_to_bytes(len).to_vec())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| ProtoError::InvalidMessage("string is not utf-8"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn has_more(&self) -> bool {
        self.buf.has_remaining()
    }
}
