//! Message buffers and typed views.
//!
//! A [`MessageBuffer`] is an immutable, atomically reference-counted byte
//! block holding one complete protocol message, optionally prefixed with its
//! 16-bit message ID. Buffers are the single unit shared between socket
//! receive paths, dispatch, send queues, and the front-end forwarding
//! channel: cloning a buffer is a reference-count increment, dropping the
//! last handle frees the storage.
//!
//! Three cursor views share a buffer's storage:
//! - [`MessageWriter`] builds a message in host byte order and freezes it.
//! - [`MessageReader`] consumes a message, byte-reversing multi-byte values
//!   when its `swap_on_read` flag is set.
//! - [`MessageEditor`] mutates an already-serialized message in place
//!   (endianness swaps, forwarded-header rewrites).

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::MessageId;

/// Sequential byte producer, used by codecs that work over any cursor.
pub trait ByteSource {
    fn get_u8(&mut self) -> Result<u8>;
}

/// Sequential byte consumer, used by codecs that work over any cursor.
pub trait ByteSink {
    fn put_u8(&mut self, value: u8);
}

/// One complete protocol message.
///
/// The wire image starts with the 2-byte message ID when the buffer was
/// created with one; `payload()` skips it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    bytes: Bytes,
    message_id: Option<MessageId>,
}

impl MessageBuffer {
    /// Wraps raw wire bytes that carry no embedded message ID.
    pub fn from_bytes(bytes: Bytes) -> Self {
        MessageBuffer {
            bytes,
            message_id: None,
        }
    }

    /// Wraps raw wire bytes whose first two bytes are the given message ID.
    pub fn with_id(bytes: Bytes, message_id: MessageId) -> Self {
        MessageBuffer {
            bytes,
            message_id: Some(message_id),
        }
    }

    /// The embedded message ID, if the buffer was created with one.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// Total wire size, including the embedded ID if present.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The full wire image.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The message payload, past the embedded ID if present.
    pub fn payload(&self) -> &[u8] {
        match self.message_id {
            Some(_) => &self.bytes[2..],
            None => &self.bytes,
        }
    }

    /// A reader positioned at the start of the payload.
    pub fn payload_reader(&self, swap_on_read: bool) -> MessageReader<'_> {
        MessageReader::new(self.payload(), swap_on_read)
    }

    /// Converts into an editor over uniquely-owned storage.
    ///
    /// Zero-copy when this handle is the only reference; copies otherwise.
    pub fn edit(self) -> MessageEditor {
        let message_id = self.message_id;
        let buf = match self.bytes.try_into_mut() {
            Ok(buf) => buf,
            Err(shared) => BytesMut::from(&shared[..]),
        };
        let pos = if message_id.is_some() { 2 } else { 0 };
        MessageEditor {
            buf,
            message_id,
            pos,
        }
    }
}

/// Advancing write cursor building a new message in host byte order.
///
/// Peers that detect a foreign byte order at handshake swap on read, so the
/// writer never swaps.
pub struct MessageWriter {
    buf: BytesMut,
    message_id: Option<MessageId>,
}

impl MessageWriter {
    /// Starts a message with the given ID; the ID occupies the first two
    /// payload bytes.
    pub fn new(message_id: MessageId, payload_size: usize) -> Self {
        let mut buf = BytesMut::with_capacity(2 + payload_size);
        buf.put_u16_ne(message_id);
        MessageWriter {
            buf,
            message_id: Some(message_id),
        }
    }

    /// Starts a message without an embedded ID (pre-handshake exchanges and
    /// stored object serializations).
    pub fn headerless(payload_size: usize) -> Self {
        MessageWriter {
            buf: BytesMut::with_capacity(payload_size),
            message_id: None,
        }
    }

    /// Bytes written so far, excluding the embedded ID.
    pub fn payload_len(&self) -> usize {
        match self.message_id {
            Some(_) => self.buf.len() - 2,
            None => self.buf.len(),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_ne(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_ne(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_ne(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_ne(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_ne(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_ne(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_u32_ne(v.to_bits());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_u64_ne(v.to_bits());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes a boolean as a single `0`/`1` byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Shrinks the logical message to the bytes written so far and freezes.
    pub fn finish(self) -> MessageBuffer {
        MessageBuffer {
            bytes: self.buf.freeze(),
            message_id: self.message_id,
        }
    }
}

impl ByteSink for MessageWriter {
    fn put_u8(&mut self, value: u8) {
        self.write_u8(value);
    }
}

/// Advancing read cursor over a serialized message.
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
    swap_on_read: bool,
}

macro_rules! reader_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            let raw = self.take(std::mem::size_of::<$ty>())?;
            let v = <$ty>::from_ne_bytes(raw.try_into().unwrap());
            Ok(if self.swap_on_read { v.swap_bytes() } else { v })
        }
    };
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8], swap_on_read: bool) -> Self {
        MessageReader {
            data,
            pos: 0,
            swap_on_read,
        }
    }

    pub fn swap_on_read(&self) -> bool {
        self.swap_on_read
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "message truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    reader_int!(read_u16, u16);
    reader_int!(read_i16, i16);
    reader_int!(read_u32, u32);
    reader_int!(read_i32, i32);
    reader_int!(read_u64, u64);
    reader_int!(read_i64, i64);

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a boolean flag; any nonzero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Borrows the next `n` bytes without copying.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_raw(&mut self, dst: &mut [u8]) -> Result<()> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

impl ByteSource for MessageReader<'_> {
    fn get_u8(&mut self) -> Result<u8> {
        self.read_u8()
    }
}

/// Advancing cursor for in-place mutation of a serialized message.
///
/// Reads never swap: the editor works on the bytes as they sit on the wire.
pub struct MessageEditor {
    buf: BytesMut,
    message_id: Option<MessageId>,
    pos: usize,
}

impl MessageEditor {
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            bail!(
                "serialization truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            );
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.check(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Overwrites bytes at the cursor without advancing.
    pub fn overwrite(&mut self, bytes: &[u8]) -> Result<()> {
        self.check(bytes.len())?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Byte-reverses the next `n` bytes in place and advances past them.
    pub fn reverse(&mut self, n: usize) -> Result<()> {
        self.check(n)?;
        self.buf[self.pos..self.pos + n].reverse();
        self.pos += n;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check(n)?;
        self.pos += n;
        Ok(())
    }

    /// Re-freezes the storage into a message buffer.
    pub fn finish(self) -> MessageBuffer {
        MessageBuffer {
            bytes: self.buf.freeze(),
            message_id: self.message_id,
        }
    }
}

impl ByteSource for MessageEditor {
    fn get_u8(&mut self) -> Result<u8> {
        self.read_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_roundtrip() {
        let mut writer = MessageWriter::new(7, 32);
        writer.write_u32(0xdead_beef);
        writer.write_i16(-5);
        writer.write_bool(true);
        writer.write_f64(1.5);
        writer.write_raw(b"abc");
        let buf = writer.finish();

        assert_eq!(buf.message_id(), Some(7));
        assert_eq!(buf.len(), 2 + 4 + 2 + 1 + 8 + 3);

        let mut reader = buf.payload_reader(false);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_i16().unwrap(), -5);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert_eq!(reader.read_bytes(3).unwrap(), b"abc");
        assert!(reader.is_empty());
    }

    #[test]
    fn reader_swaps_when_flagged() {
        let mut writer = MessageWriter::headerless(8);
        writer.write_u32(0x0102_0304);
        let buf = writer.finish();

        let buf_clone = buf.clone();
        let mut swapped = buf_clone.payload_reader(true);
        assert_eq!(swapped.read_u32().unwrap(), 0x0403_0201);

        let mut plain = buf.payload_reader(false);
        assert_eq!(plain.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn reader_rejects_short_message() {
        let mut writer = MessageWriter::headerless(2);
        writer.write_u16(1);
        let buf = writer.finish();

        let mut reader = buf.payload_reader(false);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn editor_reverses_in_place() {
        let mut writer = MessageWriter::headerless(4);
        writer.write_raw(&[1, 2, 3, 4]);
        let buf = writer.finish();

        let mut editor = buf.edit();
        editor.reverse(4).unwrap();
        let buf = editor.finish();
        assert_eq!(buf.payload(), &[4, 3, 2, 1]);
    }

    #[test]
    fn edit_is_zero_copy_for_unique_handles() {
        let mut writer = MessageWriter::new(1, 4);
        writer.write_u32(42);
        let buf = writer.finish();
        let ptr = buf.as_slice().as_ptr();

        let editor = buf.edit();
        let buf = editor.finish();
        assert_eq!(buf.as_slice().as_ptr(), ptr);
    }

    #[test]
    fn clones_share_storage() {
        let mut writer = MessageWriter::new(3, 4);
        writer.write_u32(99);
        let buf = writer.finish();
        let other = buf.clone();
        assert_eq!(buf.as_slice().as_ptr(), other.as_slice().as_ptr());
        drop(buf);
        assert_eq!(other.message_id(), Some(3));
    }
}
