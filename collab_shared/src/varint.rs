//! Variable-length encoding of 32-bit unsigned integers.
//!
//! A value occupies 1-5 bytes. The number of leading one bits in the first
//! byte is the count `r` of continuation bytes; the remaining low bits of
//! the first byte carry the high bits of the value; the `r` continuation
//! bytes carry the low `8*r` bits of the value in little-endian order. The
//! encoding is byte-oriented, so it needs no endianness swap.
//!
//! | value            | bytes | first-byte pattern |
//! |------------------|-------|--------------------|
//! | `< 2^7`          | 1     | `0vvvvvvv`         |
//! | `< 2^14`         | 2     | `10vvvvvv`         |
//! | `< 2^21`         | 3     | `110vvvvv`         |
//! | `< 2^28`         | 4     | `1110vvvv`         |
//! | otherwise        | 5     | `1111xxxx`         |

use anyhow::{bail, Result};

use crate::buffer::{ByteSink, ByteSource};

/// Returns the encoded size of the given value in bytes.
pub fn size(value: u32) -> usize {
    if value < 1 << 7 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 21 {
        3
    } else if value < 1 << 28 {
        4
    } else {
        5
    }
}

/// Writes the given value to the sink.
pub fn write<S: ByteSink>(value: u32, sink: &mut S) {
    let remaining = size(value) - 1;
    // Leading-ones prefix, then the value's high bits in the first byte.
    let first = match remaining {
        0 => value as u8,
        1 => 0x80 | (value >> 8) as u8,
        2 => 0xc0 | (value >> 16) as u8,
        3 => 0xe0 | (value >> 24) as u8,
        _ => 0xf0,
    };
    sink.put_u8(first);
    for i in 0..remaining {
        sink.put_u8((value >> (8 * i)) as u8);
    }
}

/// Decodes the first byte: returns the count of continuation bytes and
/// seeds the value with the first byte's payload bits.
pub fn read_first<S: ByteSource>(source: &mut S) -> Result<(usize, u32)> {
    let first = source.get_u8()?;
    let remaining = first.leading_ones() as usize;
    if remaining > 4 {
        bail!("malformed VarInt prefix {first:#04x}");
    }
    let payload_bits = u32::from(first) & (0xff >> remaining);
    let value = if remaining < 4 {
        payload_bits << (8 * remaining)
    } else {
        // Five-byte form: the first byte carries no value bits.
        0
    };
    Ok((remaining, value))
}

/// Reads the continuation bytes determined by [`read_first`] into `value`.
pub fn read_remaining<S: ByteSource>(source: &mut S, remaining: usize, value: &mut u32) -> Result<()> {
    for i in 0..remaining {
        *value |= u32::from(source.get_u8()?) << (8 * i);
    }
    Ok(())
}

/// Reads a complete value from the source.
pub fn read<S: ByteSource>(source: &mut S) -> Result<u32> {
    let (remaining, mut value) = read_first(source)?;
    read_remaining(source, remaining, &mut value)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageWriter;

    fn roundtrip(value: u32) -> (usize, u32) {
        let mut writer = MessageWriter::headerless(5);
        write(value, &mut writer);
        let buf = writer.finish();
        let encoded_len = buf.len();
        let mut reader = buf.payload_reader(false);
        let decoded = read(&mut reader).unwrap();
        assert!(reader.is_empty());
        (encoded_len, decoded)
    }

    #[test]
    fn each_encoded_length() {
        // One boundary pair per encoded length, 1 through 5 bytes.
        for (value, expected_len) in [
            (0u32, 1),
            (127, 1),
            (128, 2),
            ((1 << 14) - 1, 2),
            (1 << 14, 3),
            ((1 << 21) - 1, 3),
            (1 << 21, 4),
            ((1 << 28) - 1, 4),
            (1 << 28, 5),
            (u32::MAX, 5),
        ] {
            assert_eq!(size(value), expected_len, "size of {value}");
            let (encoded_len, decoded) = roundtrip(value);
            assert_eq!(encoded_len, expected_len, "encoding of {value}");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn split_read_matches_whole_read() {
        let mut writer = MessageWriter::headerless(5);
        write(100_000, &mut writer);
        let buf = writer.finish();
        let mut reader = buf.payload_reader(false);
        let (remaining, mut value) = read_first(&mut reader).unwrap();
        assert_eq!(remaining, 3 - 1);
        read_remaining(&mut reader, remaining, &mut value).unwrap();
        assert_eq!(value, 100_000);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut writer = MessageWriter::headerless(5);
        write(u32::MAX, &mut writer);
        let buf = writer.finish();
        let truncated = &buf.payload()[..3];
        let mut reader = crate::buffer::MessageReader::new(truncated, false);
        assert!(read(&mut reader).is_err());
    }
}
