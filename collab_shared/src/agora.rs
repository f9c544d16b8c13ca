//! Real-time audio forwarding plug-in protocol.
//!
//! Carries encoded audio packets between clients; capture and codecs live
//! outside the core, which only sees opaque packet bytes plus a sequence
//! number. Packets prefer the datagram channel and fall back to TCP for
//! peers without a completed UDP handshake; receivers absorb reordering
//! and duplication with a [`crate::jitter::JitterBuffer`].

use anyhow::Result;

use crate::buffer::{MessageBuffer, MessageReader, MessageWriter};
use crate::jitter::Sequence;
use crate::protocol::{ClientId, MessageId};

pub const AGORA_PROTOCOL_NAME: &str = "Agora";
pub const AGORA_PROTOCOL_VERSION: u32 = 1 << 16;

/// Agora message IDs sent by clients, relative to the negotiated base.
pub const CONNECT_REQUEST: MessageId = 0;
pub const AUDIO_PACKET_REQUEST: MessageId = 1;
pub const NUM_CLIENT_MESSAGES: MessageId = 2;

/// Agora message IDs sent by servers, relative to the negotiated base.
pub const CONNECT_NOTIFICATION: MessageId = 0;
pub const AUDIO_PACKET_REPLY: MessageId = 1;
pub const NUM_SERVER_MESSAGES: MessageId = 2;

/// Client's announcement of its audio stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub sample_rate: u32,
    /// Audio frames per encoded packet.
    pub packet_frames: u32,
}

impl ConnectRequest {
    pub fn encode(&self, client_base: MessageId) -> MessageBuffer {
        let mut writer = MessageWriter::new(client_base + CONNECT_REQUEST, 8);
        writer.write_u32(self.sample_rate);
        writer.write_u32(self.packet_frames);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(ConnectRequest {
            sample_rate: reader.read_u32()?,
            packet_frames: reader.read_u32()?,
        })
    }
}

/// Server's announcement of a peer's audio stream to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectNotification {
    pub client_id: ClientId,
    pub sample_rate: u32,
    pub packet_frames: u32,
}

impl ConnectNotification {
    pub fn encode(&self, server_base: MessageId) -> MessageBuffer {
        let mut writer = MessageWriter::new(server_base + CONNECT_NOTIFICATION, 10);
        writer.write_u16(self.client_id);
        writer.write_u32(self.sample_rate);
        writer.write_u32(self.packet_frames);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(ConnectNotification {
            client_id: reader.read_u16()?,
            sample_rate: reader.read_u32()?,
            packet_frames: reader.read_u32()?,
        })
    }
}

/// One encoded audio packet.
///
/// In a request the leading client ID is the destination (zero for
/// broadcast); in a forwarded reply it is the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub client_id: ClientId,
    pub sequence: Sequence,
    pub data: Vec<u8>,
}

impl AudioPacket {
    pub fn encode(&self, message_id: MessageId) -> MessageBuffer {
        let mut writer = MessageWriter::new(message_id, 6 + self.data.len());
        writer.write_u16(self.client_id);
        writer.write_i16(self.sequence);
        writer.write_u16(self.data.len() as u16);
        writer.write_raw(&self.data);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let client_id = reader.read_u16()?;
        let sequence = reader.read_i16()?;
        let len = reader.read_u16()? as usize;
        Ok(AudioPacket {
            client_id,
            sequence,
            data: reader.read_bytes(len)?.to_vec(),
        })
    }

    /// Reads only the header fields, leaving the cursor at the packet data.
    pub fn decode_header(reader: &mut MessageReader<'_>) -> Result<(ClientId, Sequence, usize)> {
        Ok((
            reader.read_u16()?,
            reader.read_i16()?,
            reader.read_u16()? as usize,
        ))
    }
}

/// Turns a received `AudioPacketRequest` wire image into the
/// `AudioPacketReply` to forward, stamping the source client.
///
/// When the packet already matches the server's byte order only the header
/// is rewritten in place; a byte-reversed packet is decoded and re-encoded.
pub fn forwarded_reply(
    packet: MessageBuffer,
    server_base: MessageId,
    source: ClientId,
    swap: bool,
) -> Result<MessageBuffer> {
    let reply_id = server_base + AUDIO_PACKET_REPLY;
    if swap {
        let mut reader = MessageReader::new(packet.as_slice(), true);
        reader.skip(2)?;
        let decoded = AudioPacket::decode(&mut reader)?;
        return Ok(AudioPacket {
            client_id: source,
            ..decoded
        }
        .encode(reply_id));
    }
    let mut editor = packet.edit();
    editor.overwrite(&reply_id.to_ne_bytes())?;
    editor.skip(2)?;
    editor.overwrite(&source.to_ne_bytes())?;
    Ok(editor.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_packet_roundtrip() {
        let packet = AudioPacket {
            client_id: 0,
            sequence: -3,
            data: vec![1, 2, 3, 4, 5],
        };
        let buf = packet.encode(10);
        let mut reader = buf.payload_reader(false);
        assert_eq!(AudioPacket::decode(&mut reader).unwrap(), packet);
        assert!(reader.is_empty());
    }

    #[test]
    fn forwarded_reply_rewrites_header_in_place() {
        let request = AudioPacket {
            client_id: 0,
            sequence: 12,
            data: vec![9, 9, 9],
        };
        // A datagram arrives as a raw wire image without the ID split off.
        let raw = MessageBuffer::from_bytes(bytes::Bytes::copy_from_slice(
            request.encode(5).as_slice(),
        ));

        let reply = forwarded_reply(raw, 8, 42, false).unwrap();
        let mut reader = MessageReader::new(reply.as_slice(), false);
        assert_eq!(reader.read_u16().unwrap(), 8 + AUDIO_PACKET_REPLY);
        let decoded = AudioPacket::decode(&mut reader).unwrap();
        assert_eq!(decoded.client_id, 42);
        assert_eq!(decoded.sequence, 12);
        assert_eq!(decoded.data, vec![9, 9, 9]);
    }

    #[test]
    fn forwarded_reply_reencodes_swapped_packets() {
        let request = AudioPacket {
            client_id: 0,
            sequence: 300,
            data: vec![7, 8],
        };
        // A raw datagram image, then byte-reverse the id, client, sequence,
        // and length fields to fake a foreign-order sender; packet data
        // stays opaque.
        let raw = MessageBuffer::from_bytes(bytes::Bytes::copy_from_slice(
            request.encode(5).as_slice(),
        ));
        let mut editor = raw.edit();
        for _ in 0..4 {
            editor.reverse(2).unwrap();
        }
        let foreign = editor.finish();

        let reply = forwarded_reply(foreign, 8, 7, true).unwrap();
        let mut reader = MessageReader::new(reply.as_slice(), false);
        assert_eq!(reader.read_u16().unwrap(), 8 + AUDIO_PACKET_REPLY);
        let decoded = AudioPacket::decode(&mut reader).unwrap();
        assert_eq!(decoded.client_id, 7);
        assert_eq!(decoded.sequence, 300);
        assert_eq!(decoded.data, vec![7, 8]);
    }
}
