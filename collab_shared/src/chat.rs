//! Text chat plug-in protocol.
//!
//! The smallest bundled plug-in: a client submits a text message addressed
//! to one peer or to everyone, and the server forwards it to the chat
//! participants with the source filled in.

use anyhow::{bail, Result};

use crate::buffer::{MessageBuffer, MessageReader, MessageWriter};
use crate::protocol::{ClientId, MessageId};

pub const CHAT_PROTOCOL_NAME: &str = "Chat";
pub const CHAT_PROTOCOL_VERSION: u32 = 1 << 16;

/// Chat message IDs sent by clients, relative to the negotiated base.
pub const MESSAGE_REQUEST: MessageId = 0;
pub const NUM_CLIENT_MESSAGES: MessageId = 1;

/// Chat message IDs sent by servers, relative to the negotiated base.
pub const MESSAGE_REPLY: MessageId = 0;
pub const NUM_SERVER_MESSAGES: MessageId = 1;

/// Longest chat message accepted, in bytes.
pub const MAX_MESSAGE_LENGTH: usize = u16::MAX as usize;

/// Client's request to deliver a chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    /// Destination client, or zero to broadcast to all other participants.
    pub destination: ClientId,
    pub text: String,
}

impl MessageRequest {
    pub fn encode(&self, client_base: MessageId) -> Result<MessageBuffer> {
        let bytes = self.text.as_bytes();
        if bytes.len() > MAX_MESSAGE_LENGTH {
            bail!("chat message of {} bytes is too long", bytes.len());
        }
        let mut writer = MessageWriter::new(client_base + MESSAGE_REQUEST, 4 + bytes.len());
        writer.write_u16(self.destination);
        writer.write_u16(bytes.len() as u16);
        writer.write_raw(bytes);
        Ok(writer.finish())
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let destination = reader.read_u16()?;
        let len = reader.read_u16()? as usize;
        let text = String::from_utf8_lossy(reader.read_bytes(len)?).into_owned();
        Ok(MessageRequest { destination, text })
    }
}

/// Server's forwarded chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReply {
    pub source: ClientId,
    /// Set when the message was addressed to this client alone.
    pub private: bool,
    pub text: String,
}

impl MessageReply {
    pub fn encode(&self, server_base: MessageId) -> Result<MessageBuffer> {
        let bytes = self.text.as_bytes();
        if bytes.len() > MAX_MESSAGE_LENGTH {
            bail!("chat message of {} bytes is too long", bytes.len());
        }
        let mut writer = MessageWriter::new(server_base + MESSAGE_REPLY, 5 + bytes.len());
        writer.write_u16(self.source);
        writer.write_bool(self.private);
        writer.write_u16(bytes.len() as u16);
        writer.write_raw(bytes);
        Ok(writer.finish())
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let source = reader.read_u16()?;
        let private = reader.read_bool()?;
        let len = reader.read_u16()? as usize;
        let text = String::from_utf8_lossy(reader.read_bytes(len)?).into_owned();
        Ok(MessageReply {
            source,
            private,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = MessageRequest {
            destination: 0,
            text: "hello everyone".into(),
        };
        let buf = request.encode(4).unwrap();
        assert_eq!(buf.message_id(), Some(4));
        let mut reader = buf.payload_reader(false);
        assert_eq!(MessageRequest::decode(&mut reader).unwrap(), request);
        assert!(reader.is_empty());
    }

    #[test]
    fn reply_roundtrip() {
        let reply = MessageReply {
            source: 9,
            private: true,
            text: "psst".into(),
        };
        let buf = reply.encode(8).unwrap();
        let mut reader = buf.payload_reader(false);
        assert_eq!(MessageReply::decode(&mut reader).unwrap(), reply);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let request = MessageRequest {
            destination: 0,
            text: "x".repeat(MAX_MESSAGE_LENGTH + 1),
        };
        assert!(request.encode(4).is_err());
    }
}
