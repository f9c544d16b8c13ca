//! Core client/server protocol: message IDs, handshake messages, and the
//! common wire helpers shared by every protocol layer.
//!
//! Every TCP message is a 16-bit message ID followed by a message-specific
//! payload. The core reserves the lowest IDs in each direction; negotiated
//! plug-in protocols are assigned contiguous ranges above them during the
//! handshake. The pre-handshake `PasswordRequest` / `ConnectRequest`
//! exchange is sent without IDs; both begin with the endianness marker so
//! each side can detect a foreign byte order before parsing anything else.

use anyhow::{bail, Result};

use crate::buffer::{MessageBuffer, MessageReader, MessageWriter};

/// Message tag carried in front of every TCP message and UDP datagram.
pub type MessageId = u16;

/// Server-assigned client identifier; nonzero, unique for the server's
/// lifetime. Zero means "broadcast to all others" in request fields.
pub type ClientId = u16;

/// Non-palindromic constant opening the handshake in both directions. A
/// peer that reads it byte-reversed sets `swap_on_read` on the connection.
pub const ENDIANNESS_MARKER: u32 = 0x1234_5678;

/// Core protocol version, major in the high 16 bits (1.0).
pub const CORE_PROTOCOL_VERSION: u32 = 1 << 16;

/// Length of the handshake nonce in bytes.
pub const NONCE_LENGTH: usize = 16;

/// Length of the password challenge hash in bytes (128-bit MD5).
pub const HASH_LENGTH: usize = 16;

/// Length of fixed, zero-padded name fields in bytes.
pub const NAME_LENGTH: usize = 32;

/// Core message IDs sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ClientMessage {
    DisconnectRequest = 0,
    /// Must not be zero: the first datagram's ID doubles as the endianness
    /// probe on the UDP channel.
    UdpConnectRequest = 1,
    PingRequest = 2,
    NameChangeRequest = 3,
}

/// Number of core client message IDs; plug-in client ranges start here.
pub const NUM_CLIENT_MESSAGES: MessageId = 4;

impl ClientMessage {
    pub const fn id(self) -> MessageId {
        self as MessageId
    }

    pub fn from_id(id: MessageId) -> Option<Self> {
        match id {
            0 => Some(ClientMessage::DisconnectRequest),
            1 => Some(ClientMessage::UdpConnectRequest),
            2 => Some(ClientMessage::PingRequest),
            3 => Some(ClientMessage::NameChangeRequest),
            _ => None,
        }
    }
}

/// Core message IDs sent by servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServerMessage {
    ConnectReply = 0,
    ConnectReject = 1,
    UdpConnectReply = 2,
    PingReply = 3,
    NameChangeReply = 4,
    ClientConnectNotification = 5,
    NameChangeNotification = 6,
    ClientDisconnectNotification = 7,
}

/// Number of core server message IDs; plug-in server ranges start here.
pub const NUM_SERVER_MESSAGES: MessageId = 8;

impl ServerMessage {
    pub const fn id(self) -> MessageId {
        self as MessageId
    }

    pub fn from_id(id: MessageId) -> Option<Self> {
        match id {
            0 => Some(ServerMessage::ConnectReply),
            1 => Some(ServerMessage::ConnectReject),
            2 => Some(ServerMessage::UdpConnectReply),
            3 => Some(ServerMessage::PingReply),
            4 => Some(ServerMessage::NameChangeReply),
            5 => Some(ServerMessage::ClientConnectNotification),
            6 => Some(ServerMessage::NameChangeNotification),
            7 => Some(ServerMessage::ClientDisconnectNotification),
            _ => None,
        }
    }
}

/// Interprets a received endianness marker: `Ok(false)` for matching byte
/// order, `Ok(true)` for reversed.
pub fn detect_swap(marker: u32) -> Result<bool> {
    if marker == ENDIANNESS_MARKER {
        Ok(false)
    } else if marker == ENDIANNESS_MARKER.swap_bytes() {
        Ok(true)
    } else {
        bail!("bad endianness marker {marker:#010x}");
    }
}

/// True when the two protocol versions agree on their major halves.
pub fn versions_compatible(a: u32, b: u32) -> bool {
    a >> 16 == b >> 16
}

/// Challenge hash: 128-bit digest of `password || nonce`. An empty password
/// hashes the nonce alone.
pub fn password_hash(password: &str, nonce: &[u8; NONCE_LENGTH]) -> [u8; HASH_LENGTH] {
    let mut input = Vec::with_capacity(password.len() + NONCE_LENGTH);
    input.extend_from_slice(password.as_bytes());
    input.extend_from_slice(nonce);
    md5::compute(input).0
}

/// Writes a string into a fixed zero-padded field, truncating if needed.
pub fn write_name_field(name: &str, writer: &mut MessageWriter) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LENGTH);
    writer.write_raw(&bytes[..n]);
    for _ in n..NAME_LENGTH {
        writer.write_u8(0);
    }
}

/// Reads a fixed zero-padded name field.
pub fn read_name_field(reader: &mut MessageReader<'_>) -> Result<String> {
    let mut field = [0u8; NAME_LENGTH];
    reader.read_raw(&mut field)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LENGTH);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// First server message, sent headerless right after accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    pub protocol_version: u32,
    pub nonce: [u8; NONCE_LENGTH],
}

impl PasswordRequest {
    pub const SIZE: usize = 4 + 4 + NONCE_LENGTH;

    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::headerless(Self::SIZE);
        writer.write_u32(ENDIANNESS_MARKER);
        writer.write_u32(self.protocol_version);
        writer.write_raw(&self.nonce);
        writer.finish()
    }

    /// Decodes everything past the endianness marker.
    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let protocol_version = reader.read_u32()?;
        let mut nonce = [0u8; NONCE_LENGTH];
        reader.read_raw(&mut nonce)?;
        Ok(PasswordRequest {
            protocol_version,
            nonce,
        })
    }
}

/// One plug-in protocol requested by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRequest {
    pub name: String,
    pub version: u32,
}

/// First client message, sent headerless in response to [`PasswordRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: u32,
    pub hash: [u8; HASH_LENGTH],
    pub client_name: String,
    pub protocols: Vec<ProtocolRequest>,
}

impl ConnectRequest {
    /// Size up to and including the protocol count.
    pub const FIXED_SIZE: usize = 4 + 4 + HASH_LENGTH + NAME_LENGTH + 2;
    /// Size of one protocol request entry.
    pub const REQUEST_SIZE: usize = NAME_LENGTH + 4;

    pub fn encode(&self) -> MessageBuffer {
        let mut writer =
            MessageWriter::headerless(Self::FIXED_SIZE + self.protocols.len() * Self::REQUEST_SIZE);
        writer.write_u32(ENDIANNESS_MARKER);
        writer.write_u32(self.protocol_version);
        writer.write_raw(&self.hash);
        write_name_field(&self.client_name, &mut writer);
        writer.write_u16(self.protocols.len() as u16);
        for protocol in &self.protocols {
            write_name_field(&protocol.name, &mut writer);
            writer.write_u32(protocol.version);
        }
        writer.finish()
    }

    /// Decodes everything past the endianness marker.
    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let protocol_version = reader.read_u32()?;
        let mut hash = [0u8; HASH_LENGTH];
        reader.read_raw(&mut hash)?;
        let client_name = read_name_field(reader)?;
        let num_protocols = reader.read_u16()?;
        let mut protocols = Vec::with_capacity(num_protocols as usize);
        for _ in 0..num_protocols {
            let name = read_name_field(reader)?;
            let version = reader.read_u32()?;
            protocols.push(ProtocolRequest { name, version });
        }
        Ok(ConnectRequest {
            protocol_version,
            hash,
            client_name,
            protocols,
        })
    }
}

/// Outcome of negotiating one requested plug-in protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    Success = 0,
    UnknownProtocol = 1,
    WrongVersion = 2,
}

impl ProtocolStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ProtocolStatus::Success),
            1 => Some(ProtocolStatus::UnknownProtocol),
            2 => Some(ProtocolStatus::WrongVersion),
            _ => None,
        }
    }
}

/// Server's reply to one protocol request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolReply {
    pub status: ProtocolStatus,
    pub version: u32,
    /// Index into the server's plug-in table, echoed in notifications.
    pub protocol_index: u16,
    pub client_message_base: MessageId,
    pub server_message_base: MessageId,
}

/// Successful handshake completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub server_name: String,
    pub client_id: ClientId,
    /// Name granted to the client; uniquified if the requested one was taken.
    pub client_name: String,
    pub udp_ticket: u32,
    pub protocols: Vec<ProtocolReply>,
}

impl ConnectReply {
    pub fn encode(&self) -> MessageBuffer {
        let size = NAME_LENGTH + 2 + NAME_LENGTH + 4 + 2 + self.protocols.len() * 11;
        let mut writer = MessageWriter::new(ServerMessage::ConnectReply.id(), size);
        write_name_field(&self.server_name, &mut writer);
        writer.write_u16(self.client_id);
        write_name_field(&self.client_name, &mut writer);
        writer.write_u32(self.udp_ticket);
        writer.write_u16(self.protocols.len() as u16);
        for protocol in &self.protocols {
            writer.write_u8(protocol.status as u8);
            writer.write_u32(protocol.version);
            writer.write_u16(protocol.protocol_index);
            writer.write_u16(protocol.client_message_base);
            writer.write_u16(protocol.server_message_base);
        }
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let server_name = read_name_field(reader)?;
        let client_id = reader.read_u16()?;
        let client_name = read_name_field(reader)?;
        let udp_ticket = reader.read_u32()?;
        let num_protocols = reader.read_u16()?;
        let mut protocols = Vec::with_capacity(num_protocols as usize);
        for _ in 0..num_protocols {
            let status = reader.read_u8()?;
            let status = ProtocolStatus::from_u8(status)
                .ok_or_else(|| anyhow::anyhow!("invalid protocol status {status}"))?;
            protocols.push(ProtocolReply {
                status,
                version: reader.read_u32()?,
                protocol_index: reader.read_u16()?,
                client_message_base: reader.read_u16()?,
                server_message_base: reader.read_u16()?,
            });
        }
        Ok(ConnectReply {
            server_name,
            client_id,
            client_name,
            udp_ticket,
            protocols,
        })
    }
}

/// Handshake rejection; the server closes the connection after sending it.
pub fn encode_connect_reject() -> MessageBuffer {
    MessageWriter::new(ServerMessage::ConnectReject.id(), 0).finish()
}

/// Client's datagram binding its observed source address to its ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpConnectRequest {
    pub client_id: ClientId,
    pub ticket: u32,
}

impl UdpConnectRequest {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::new(ClientMessage::UdpConnectRequest.id(), 6);
        writer.write_u16(self.client_id);
        writer.write_u32(self.ticket);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(UdpConnectRequest {
            client_id: reader.read_u16()?,
            ticket: reader.read_u32()?,
        })
    }
}

/// Server's confirmation of the UDP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpConnectReply {
    pub ticket: u32,
}

impl UdpConnectReply {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::new(ServerMessage::UdpConnectReply.id(), 4);
        writer.write_u32(self.ticket);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(UdpConnectReply {
            ticket: reader.read_u32()?,
        })
    }
}

/// Ping payload; either side may originate, the recipient echoes it
/// verbatim under the reply ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub sequence: i16,
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Ping {
    pub const SIZE: usize = 2 + 8 + 8;

    pub fn encode(&self, message_id: MessageId) -> MessageBuffer {
        let mut writer = MessageWriter::new(message_id, Self::SIZE);
        writer.write_i16(self.sequence);
        writer.write_i64(self.seconds);
        writer.write_i64(self.nanoseconds);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Ping {
            sequence: reader.read_i16()?,
            seconds: reader.read_i64()?,
            nanoseconds: reader.read_i64()?,
        })
    }
}

/// Client's request to change its own name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChangeRequest {
    pub name: String,
}

impl NameChangeRequest {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::new(ClientMessage::NameChangeRequest.id(), NAME_LENGTH);
        write_name_field(&self.name, &mut writer);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(NameChangeRequest {
            name: read_name_field(reader)?,
        })
    }
}

/// Server's answer to a name change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChangeReply {
    pub granted: bool,
    /// The new name if granted, the old one otherwise.
    pub name: String,
}

impl NameChangeReply {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::new(ServerMessage::NameChangeReply.id(), 1 + NAME_LENGTH);
        writer.write_bool(self.granted);
        write_name_field(&self.name, &mut writer);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(NameChangeReply {
            granted: reader.read_bool()?,
            name: read_name_field(reader)?,
        })
    }
}

/// Broadcast when a client's rename was granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChangeNotification {
    pub client_id: ClientId,
    pub name: String,
}

impl NameChangeNotification {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer =
            MessageWriter::new(ServerMessage::NameChangeNotification.id(), 2 + NAME_LENGTH);
        writer.write_u16(self.client_id);
        write_name_field(&self.name, &mut writer);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(NameChangeNotification {
            client_id: reader.read_u16()?,
            name: read_name_field(reader)?,
        })
    }
}

/// Announces a joined client to peers sharing at least one plug-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnectNotification {
    pub client_id: ClientId,
    pub client_name: String,
    /// Server-side indices of the plug-ins the client negotiated.
    pub protocol_indices: Vec<u16>,
}

impl ClientConnectNotification {
    pub fn encode(&self) -> MessageBuffer {
        let size = 2 + NAME_LENGTH + 2 + self.protocol_indices.len() * 2;
        let mut writer = MessageWriter::new(ServerMessage::ClientConnectNotification.id(), size);
        writer.write_u16(self.client_id);
        write_name_field(&self.client_name, &mut writer);
        writer.write_u16(self.protocol_indices.len() as u16);
        for &index in &self.protocol_indices {
            writer.write_u16(index);
        }
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        let client_id = reader.read_u16()?;
        let client_name = read_name_field(reader)?;
        let num = reader.read_u16()?;
        let mut protocol_indices = Vec::with_capacity(num as usize);
        for _ in 0..num {
            protocol_indices.push(reader.read_u16()?);
        }
        Ok(ClientConnectNotification {
            client_id,
            client_name,
            protocol_indices,
        })
    }
}

/// Announces a departed client to peers that shared a plug-in with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDisconnectNotification {
    pub client_id: ClientId,
}

impl ClientDisconnectNotification {
    pub fn encode(&self) -> MessageBuffer {
        let mut writer = MessageWriter::new(ServerMessage::ClientDisconnectNotification.id(), 2);
        writer.write_u16(self.client_id);
        writer.finish()
    }

    pub fn decode(reader: &mut MessageReader<'_>) -> Result<Self> {
        Ok(ClientDisconnectNotification {
            client_id: reader.read_u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_swap_both_orders() {
        assert!(!detect_swap(ENDIANNESS_MARKER).unwrap());
        assert!(detect_swap(ENDIANNESS_MARKER.swap_bytes()).unwrap());
        assert!(detect_swap(0).is_err());
    }

    #[test]
    fn marker_is_not_a_palindrome() {
        assert_ne!(ENDIANNESS_MARKER, ENDIANNESS_MARKER.swap_bytes());
    }

    #[test]
    fn name_field_pads_and_truncates() {
        let mut writer = MessageWriter::headerless(NAME_LENGTH * 2);
        write_name_field("alice", &mut writer);
        write_name_field(&"x".repeat(50), &mut writer);
        let buf = writer.finish();
        assert_eq!(buf.len(), NAME_LENGTH * 2);

        let mut reader = buf.payload_reader(false);
        assert_eq!(read_name_field(&mut reader).unwrap(), "alice");
        assert_eq!(read_name_field(&mut reader).unwrap(), "x".repeat(NAME_LENGTH));
    }

    #[test]
    fn connect_request_roundtrip() {
        let request = ConnectRequest {
            protocol_version: CORE_PROTOCOL_VERSION,
            hash: [7; HASH_LENGTH],
            client_name: "alice".into(),
            protocols: vec![
                ProtocolRequest {
                    name: "Chat".into(),
                    version: 1 << 16,
                },
                ProtocolRequest {
                    name: "Koinonia".into(),
                    version: 1 << 16,
                },
            ],
        };
        let buf = request.encode();
        let mut reader = buf.payload_reader(false);
        assert!(!detect_swap(reader.read_u32().unwrap()).unwrap());
        assert_eq!(ConnectRequest::decode(&mut reader).unwrap(), request);
        assert!(reader.is_empty());
    }

    #[test]
    fn connect_reply_roundtrip() {
        let reply = ConnectReply {
            server_name: "server".into(),
            client_id: 3,
            client_name: "alice (2)".into(),
            udp_ticket: 0xdead_beef,
            protocols: vec![ProtocolReply {
                status: ProtocolStatus::Success,
                version: 1 << 16,
                protocol_index: 0,
                client_message_base: NUM_CLIENT_MESSAGES,
                server_message_base: NUM_SERVER_MESSAGES,
            }],
        };
        let buf = reply.encode();
        assert_eq!(buf.message_id(), Some(ServerMessage::ConnectReply.id()));
        let mut reader = buf.payload_reader(false);
        assert_eq!(ConnectReply::decode(&mut reader).unwrap(), reply);
    }

    #[test]
    fn ping_roundtrip_with_swapped_reader() {
        let ping = Ping {
            sequence: 42,
            seconds: 1_700_000_000,
            nanoseconds: 0,
        };
        let buf = ping.encode(ClientMessage::PingRequest.id());

        // Simulate the peer's view of a byte-reversed stream: swap every
        // field in place, then read with the swap flag set.
        let mut editor = buf.edit();
        editor.reverse(2).unwrap();
        editor.reverse(8).unwrap();
        editor.reverse(8).unwrap();
        let swapped = editor.finish();
        let mut reader = swapped.payload_reader(true);
        assert_eq!(Ping::decode(&mut reader).unwrap(), ping);
    }

    #[test]
    fn password_hash_depends_on_both_inputs() {
        let nonce_a = [1u8; NONCE_LENGTH];
        let nonce_b = [2u8; NONCE_LENGTH];
        assert_eq!(password_hash("pw", &nonce_a), password_hash("pw", &nonce_a));
        assert_ne!(password_hash("pw", &nonce_a), password_hash("pw", &nonce_b));
        assert_ne!(password_hash("pw", &nonce_a), password_hash("other", &nonce_a));
    }
}
