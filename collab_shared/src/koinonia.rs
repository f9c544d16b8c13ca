//! Koinonia shared-object plug-in protocol.
//!
//! Koinonia replicates two kinds of state between clients through the
//! server:
//! - globally named static objects, looked up by name and versioned by the
//!   server, and
//! - namespaces of dynamic objects created and destroyed at run time, with
//!   server-assigned object IDs.
//!
//! Object payloads travel as serializations of a [`DataType`] dictionary
//! type; a non-fixed-size serialization is preceded by its `VarInt` byte
//! count. The server stores serializations verbatim (normalized to its own
//! byte order) and never materializes them; clients materialize values on
//! their front-end side.

use anyhow::{bail, Result};

use crate::buffer::{MessageBuffer, MessageReader, MessageWriter};
use crate::datatype::{DataType, TypeId};
use crate::protocol::MessageId;
use crate::socket::ReliableReader;
use crate::varint;

pub const KOINONIA_PROTOCOL_NAME: &str = "Koinonia";
pub const KOINONIA_PROTOCOL_VERSION: u32 = 1 << 16;

/// Identifier of a shared object, client- or server-side.
pub type ObjectId = u16;

/// Identifier of a shared namespace, client- or server-side.
pub type NamespaceId = u16;

/// Server-issued object version; strictly monotone per object.
pub type VersionNumber = u32;

/// Koinonia message IDs sent by clients, relative to the negotiated base.
pub const CREATE_OBJECT_REQUEST: MessageId = 0;
pub const REPLACE_OBJECT_REQUEST: MessageId = 1;
pub const CREATE_NAMESPACE_REQUEST: MessageId = 2;
pub const CREATE_NS_OBJECT_REQUEST: MessageId = 3;
pub const REPLACE_NS_OBJECT_REQUEST: MessageId = 4;
pub const DESTROY_NS_OBJECT_REQUEST: MessageId = 5;
pub const NUM_CLIENT_MESSAGES: MessageId = 6;

/// Koinonia message IDs sent by servers, relative to the negotiated base.
pub const CREATE_OBJECT_REPLY: MessageId = 0;
pub const REPLACE_OBJECT_REPLY: MessageId = 1;
pub const REPLACE_OBJECT_NOTIFICATION: MessageId = 2;
pub const CREATE_NAMESPACE_REPLY: MessageId = 3;
pub const CREATE_NS_OBJECT_REPLY: MessageId = 4;
pub const CREATE_NS_OBJECT_NOTIFICATION: MessageId = 5;
pub const REPLACE_NS_OBJECT_REPLY: MessageId = 6;
pub const REPLACE_NS_OBJECT_NOTIFICATION: MessageId = 7;
pub const DESTROY_NS_OBJECT_NOTIFICATION: MessageId = 8;
pub const NUM_SERVER_MESSAGES: MessageId = 9;

/// Longest object or namespace name accepted.
pub const MAX_NAME_LENGTH: usize = 256;

/// Writes a `VarInt`-length-prefixed string.
pub fn write_string(value: &str, writer: &mut MessageWriter) {
    varint::write(value.len() as u32, writer);
    writer.write_raw(value.as_bytes());
}

/// Reads a `VarInt`-length-prefixed string from a complete message.
pub fn read_string(reader: &mut MessageReader<'_>) -> Result<String> {
    let len = varint::read(reader)? as usize;
    if len > MAX_NAME_LENGTH {
        bail!("name of {len} bytes is too long");
    }
    Ok(String::from_utf8_lossy(reader.read_bytes(len)?).into_owned())
}

/// Reads a `VarInt`-length-prefixed string off a reliable socket.
pub async fn read_string_socket(reader: &mut ReliableReader) -> Result<String> {
    let len = reader.read_varint().await? as usize;
    if len > MAX_NAME_LENGTH {
        bail!("name of {len} bytes is too long");
    }
    let bytes = reader.read_vec(len).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn string_size(value: &str) -> usize {
    varint::size(value.len() as u32) + value.len()
}

/* Requests for globally named static objects. */

pub fn encode_create_object_request(
    client_base: MessageId,
    client_object_id: ObjectId,
    name: &str,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> Result<MessageBuffer> {
    let size = 2
        + string_size(name)
        + dictionary.calc_dictionary_size()
        + 1
        + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(client_base + CREATE_OBJECT_REQUEST, size);
    writer.write_u16(client_object_id);
    write_string(name, &mut writer);
    dictionary.write_dictionary(&mut writer)?;
    writer.write_u8(type_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    Ok(writer.finish())
}

pub fn encode_replace_object_request(
    client_base: MessageId,
    server_object_id: ObjectId,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(client_base + REPLACE_OBJECT_REQUEST, size);
    writer.write_u16(server_object_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

/* Replies and notifications for globally named static objects. */

pub fn encode_create_object_reply(
    server_base: MessageId,
    client_object_id: ObjectId,
    server_object_id: ObjectId,
    version: VersionNumber,
    existing: Option<(&DataType, TypeId, &[u8])>,
) -> MessageBuffer {
    let size = 2
        + 2
        + 4
        + 1
        + existing.map_or(0, |(dictionary, type_id, object)| {
            dictionary.sized_len(type_id, object)
        });
    let mut writer = MessageWriter::new(server_base + CREATE_OBJECT_REPLY, size);
    writer.write_u16(client_object_id);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    writer.write_bool(existing.is_some());
    if let Some((dictionary, type_id, object)) = existing {
        dictionary.write_sized_bytes(type_id, object, &mut writer);
    }
    writer.finish()
}

pub fn encode_replace_object_reply(
    server_base: MessageId,
    server_object_id: ObjectId,
    version: VersionNumber,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(server_base + REPLACE_OBJECT_REPLY, 6);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    writer.finish()
}

pub fn encode_replace_object_notification(
    server_base: MessageId,
    server_object_id: ObjectId,
    version: VersionNumber,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + 4 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(server_base + REPLACE_OBJECT_NOTIFICATION, size);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

/* Requests for namespaces of dynamic objects. */

pub fn encode_create_namespace_request(
    client_base: MessageId,
    client_namespace_id: NamespaceId,
    name: &str,
    dictionary: &DataType,
) -> Result<MessageBuffer> {
    let size = 2 + string_size(name) + dictionary.calc_dictionary_size();
    let mut writer = MessageWriter::new(client_base + CREATE_NAMESPACE_REQUEST, size);
    writer.write_u16(client_namespace_id);
    write_string(name, &mut writer);
    dictionary.write_dictionary(&mut writer)?;
    Ok(writer.finish())
}

pub fn encode_create_ns_object_request(
    client_base: MessageId,
    server_namespace_id: NamespaceId,
    client_object_id: ObjectId,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + 2 + 1 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(client_base + CREATE_NS_OBJECT_REQUEST, size);
    writer.write_u16(server_namespace_id);
    writer.write_u16(client_object_id);
    writer.write_u8(type_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

pub fn encode_replace_ns_object_request(
    client_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + 2 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(client_base + REPLACE_NS_OBJECT_REQUEST, size);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

pub fn encode_destroy_ns_object_request(
    client_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(client_base + DESTROY_NS_OBJECT_REQUEST, 4);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    writer.finish()
}

/* Replies and notifications for namespaces. */

pub fn encode_create_namespace_reply(
    server_base: MessageId,
    client_namespace_id: NamespaceId,
    server_namespace_id: NamespaceId,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(server_base + CREATE_NAMESPACE_REPLY, 4);
    writer.write_u16(client_namespace_id);
    writer.write_u16(server_namespace_id);
    writer.finish()
}

pub fn encode_create_ns_object_reply(
    server_base: MessageId,
    server_namespace_id: NamespaceId,
    client_object_id: ObjectId,
    server_object_id: ObjectId,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(server_base + CREATE_NS_OBJECT_REPLY, 6);
    writer.write_u16(server_namespace_id);
    writer.write_u16(client_object_id);
    writer.write_u16(server_object_id);
    writer.finish()
}

pub fn encode_create_ns_object_notification(
    server_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
    version: VersionNumber,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + 2 + 4 + 1 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(server_base + CREATE_NS_OBJECT_NOTIFICATION, size);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    writer.write_u8(type_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

pub fn encode_replace_ns_object_reply(
    server_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
    version: VersionNumber,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(server_base + REPLACE_NS_OBJECT_REPLY, 8);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    writer.finish()
}

pub fn encode_replace_ns_object_notification(
    server_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
    version: VersionNumber,
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> MessageBuffer {
    let size = 2 + 2 + 4 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::new(server_base + REPLACE_NS_OBJECT_NOTIFICATION, size);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    writer.write_u32(version);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    writer.finish()
}

pub fn encode_destroy_ns_object_notification(
    server_base: MessageId,
    server_namespace_id: NamespaceId,
    server_object_id: ObjectId,
) -> MessageBuffer {
    let mut writer = MessageWriter::new(server_base + DESTROY_NS_OBJECT_NOTIFICATION, 4);
    writer.write_u16(server_namespace_id);
    writer.write_u16(server_object_id);
    writer.finish()
}

/* Persistence: object dump files. */

/// Serializes a dump of one object: dictionary wire form, type ID, and the
/// maybe-size-prefixed serialization. Byte order is the writing host's.
pub fn encode_object_file(
    dictionary: &DataType,
    type_id: TypeId,
    object: &[u8],
) -> Result<Vec<u8>> {
    let size = dictionary.calc_dictionary_size() + 1 + dictionary.sized_len(type_id, object);
    let mut writer = MessageWriter::headerless(size);
    dictionary.write_dictionary(&mut writer)?;
    writer.write_u8(type_id);
    dictionary.write_sized_bytes(type_id, object, &mut writer);
    Ok(writer.finish().payload().to_vec())
}

/// Reverses [`encode_object_file`], validating the payload.
pub fn decode_object_file(bytes: &[u8]) -> Result<(DataType, TypeId, Vec<u8>)> {
    let mut reader = MessageReader::new(bytes, false);
    let dictionary = DataType::read_dictionary(&mut reader)?;
    let type_id = reader.read_u8()?;
    let object = dictionary.read_sized_bytes(type_id, &mut reader)?.to_vec();
    if !reader.is_empty() {
        bail!("{} trailing bytes after object dump", reader.remaining());
    }
    let object = dictionary.normalize_object_bytes(type_id, object, false)?;
    Ok((dictionary, type_id, object))
}

/// Serializes a dump of one namespace: dictionary wire form, then each
/// object's ID, type, version, and maybe-size-prefixed serialization.
pub fn encode_namespace_file(
    dictionary: &DataType,
    objects: &[(ObjectId, TypeId, VersionNumber, &[u8])],
) -> Result<Vec<u8>> {
    let mut size = dictionary.calc_dictionary_size() + varint::size(objects.len() as u32);
    for (_, type_id, _, object) in objects {
        size += 2 + 1 + 4 + dictionary.sized_len(*type_id, object);
    }
    let mut writer = MessageWriter::headerless(size);
    dictionary.write_dictionary(&mut writer)?;
    varint::write(objects.len() as u32, &mut writer);
    for (object_id, type_id, version, object) in objects {
        writer.write_u16(*object_id);
        writer.write_u8(*type_id);
        writer.write_u32(*version);
        dictionary.write_sized_bytes(*type_id, object, &mut writer);
    }
    Ok(writer.finish().payload().to_vec())
}

/// Reverses [`encode_namespace_file`], validating each payload.
#[allow(clippy::type_complexity)]
pub fn decode_namespace_file(
    bytes: &[u8],
) -> Result<(DataType, Vec<(ObjectId, TypeId, VersionNumber, Vec<u8>)>)> {
    let mut reader = MessageReader::new(bytes, false);
    let dictionary = DataType::read_dictionary(&mut reader)?;
    let count = varint::read(&mut reader)?;
    let mut objects = Vec::new();
    for _ in 0..count {
        let object_id = reader.read_u16()?;
        let type_id = reader.read_u8()?;
        let version = reader.read_u32()?;
        let object = dictionary.read_sized_bytes(type_id, &mut reader)?.to_vec();
        let object = dictionary.normalize_object_bytes(type_id, object, false)?;
        objects.push((object_id, type_id, version, object));
    }
    if !reader.is_empty() {
        bail!("{} trailing bytes after namespace dump", reader.remaining());
    }
    Ok((dictionary, objects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{AtomicType, Value};

    fn flag_and_count() -> (DataType, TypeId, Value) {
        let mut dictionary = DataType::new();
        let ty = dictionary
            .create_structure(&[AtomicType::Bool.id(), AtomicType::SInt32.id()])
            .unwrap();
        let value = Value::Structure(vec![Value::Bool(true), Value::SInt32(5)]);
        (dictionary, ty, value)
    }

    #[test]
    fn create_object_request_roundtrip() {
        let (dictionary, ty, value) = flag_and_count();
        let object = dictionary.serialize_object(ty, &value).unwrap();
        let buf =
            encode_create_object_request(4, 1, "cfg", &dictionary, ty, &object).unwrap();
        assert_eq!(buf.message_id(), Some(4 + CREATE_OBJECT_REQUEST));

        let mut reader = buf.payload_reader(false);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(read_string(&mut reader).unwrap(), "cfg");
        let dict_back = DataType::read_dictionary(&mut reader).unwrap();
        assert_eq!(dict_back, dictionary);
        let ty_back = reader.read_u8().unwrap();
        assert_eq!(ty_back, ty);
        let object_back = dict_back.read_sized_bytes(ty_back, &mut reader).unwrap();
        assert_eq!(object_back, &object[..]);
        assert!(reader.is_empty());
    }

    #[test]
    fn create_object_reply_carries_existing_value() {
        let (dictionary, ty, value) = flag_and_count();
        let object = dictionary.serialize_object(ty, &value).unwrap();
        let buf = encode_create_object_reply(8, 1, 2, 0, Some((&dictionary, ty, &object)));

        let mut reader = buf.payload_reader(false);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 2);
        assert_eq!(reader.read_u32().unwrap(), 0);
        assert!(reader.read_bool().unwrap());
        let bytes = dictionary.read_sized_bytes(ty, &mut reader).unwrap();
        let mut object_reader = MessageReader::new(bytes, false);
        assert_eq!(
            dictionary.read_object(ty, &mut object_reader).unwrap(),
            value
        );
    }

    #[test]
    fn object_file_roundtrip() {
        let (dictionary, ty, value) = flag_and_count();
        let object = dictionary.serialize_object(ty, &value).unwrap();
        let file = encode_object_file(&dictionary, ty, &object).unwrap();
        let (dict_back, ty_back, object_back) = decode_object_file(&file).unwrap();
        assert_eq!(dict_back, dictionary);
        assert_eq!(ty_back, ty);
        assert_eq!(object_back, object);
    }

    #[test]
    fn namespace_file_roundtrip() {
        let (dictionary, ty, value) = flag_and_count();
        let a = dictionary.serialize_object(ty, &value).unwrap();
        let b = dictionary
            .serialize_object(ty, &Value::Structure(vec![Value::Bool(false), Value::SInt32(-1)]))
            .unwrap();
        let file = encode_namespace_file(
            &dictionary,
            &[(1, ty, 0, a.as_slice()), (2, ty, 3, b.as_slice())],
        )
        .unwrap();
        let (dict_back, objects) = decode_namespace_file(&file).unwrap();
        assert_eq!(dict_back, dictionary);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0], (1, ty, 0, a));
        assert_eq!(objects[1], (2, ty, 3, b));
    }

    #[test]
    fn corrupt_object_file_is_rejected() {
        let (dictionary, ty, value) = flag_and_count();
        let object = dictionary.serialize_object(ty, &value).unwrap();
        let mut file = encode_object_file(&dictionary, ty, &object).unwrap();
        file.truncate(file.len() - 1);
        assert!(decode_object_file(&file).is_err());
    }
}
