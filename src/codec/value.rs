//! Typed value encodings
//!
//! `Encode` turns a borrowed value into its stored bytes, `Decode` reads an
//! owned value back. Decoding with the wrong type is the caller's problem;
//! it either errors on a size mismatch or yields an unrelated value.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{MapKvError, Result};

use super::LEN_PREFIX;

/// A value that can be written into a store
pub trait Encode {
    /// Append the encoded form to `buf`
    fn encode_into(&self, buf: &mut BytesMut);

    /// Encoded length in bytes
    fn encoded_len(&self) -> usize;

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }
}

/// A value that can be read back from a store
pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
}

// =============================================================================
// Fixed-width scalars
// =============================================================================

impl Encode for bool {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn encoded_len(&self) -> usize {
        1
    }
}

impl Decode for bool {
    fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [b] => Ok(*b != 0),
            _ => Err(size_mismatch("bool", 1, bytes.len())),
        }
    }
}

impl Encode for i64 {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i64_le(*self);
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

impl Decode for i64 {
    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(size_mismatch("i64", 8, bytes.len()));
        }
        Ok(bytes.get_i64_le())
    }
}

impl Encode for f64 {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_f64_le(*self);
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

impl Decode for f64 {
    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(size_mismatch("f64", 8, bytes.len()));
        }
        Ok(bytes.get_f64_le())
    }
}

// =============================================================================
// Length-prefixed values
// =============================================================================

impl Encode for [u8] {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self);
    }

    fn encoded_len(&self) -> usize {
        LEN_PREFIX + self.len()
    }
}

impl Encode for Vec<u8> {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.as_slice().encode_into(buf)
    }

    fn encoded_len(&self) -> usize {
        self.as_slice().encoded_len()
    }
}

impl Decode for Vec<u8> {
    fn decode(mut bytes: &[u8]) -> Result<Self> {
        let raw = read_prefixed(&mut bytes, "bytes")?;
        expect_consumed(bytes, "bytes")?;
        Ok(raw.to_vec())
    }
}

impl Encode for str {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.as_bytes().encode_into(buf)
    }

    fn encoded_len(&self) -> usize {
        LEN_PREFIX + self.len()
    }
}

impl Encode for String {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.as_str().encode_into(buf)
    }

    fn encoded_len(&self) -> usize {
        self.as_str().encoded_len()
    }
}

impl Decode for String {
    fn decode(mut bytes: &[u8]) -> Result<Self> {
        let raw = read_prefixed(&mut bytes, "string")?;
        expect_consumed(bytes, "string")?;
        utf8(raw)
    }
}

impl Encode for [String] {
    fn encode_into(&self, buf: &mut BytesMut) {
        encode_list(self.iter().map(String::as_str), self.len(), buf)
    }

    fn encoded_len(&self) -> usize {
        list_len(self.iter().map(String::as_str))
    }
}

impl Encode for [&str] {
    fn encode_into(&self, buf: &mut BytesMut) {
        encode_list(self.iter().copied(), self.len(), buf)
    }

    fn encoded_len(&self) -> usize {
        list_len(self.iter().copied())
    }
}

impl Encode for Vec<String> {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.as_slice().encode_into(buf)
    }

    fn encoded_len(&self) -> usize {
        self.as_slice().encoded_len()
    }
}

impl Decode for Vec<String> {
    fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.remaining() < LEN_PREFIX {
            return Err(MapKvError::Decode("string list: missing count".to_string()));
        }
        let count = bytes.get_u32_le() as usize;

        // Each element needs at least its prefix; reject absurd counts early
        if count > bytes.remaining() / LEN_PREFIX {
            return Err(MapKvError::Decode(format!(
                "string list: count {} exceeds payload of {} bytes",
                count,
                bytes.remaining()
            )));
        }

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = read_prefixed(&mut bytes, "string list element")?;
            items.push(utf8(raw)?);
        }
        expect_consumed(bytes, "string list")?;
        Ok(items)
    }
}

/// Size of a stored value as callers see it.
///
/// For length-prefixed values whose prefix exactly covers the rest of the
/// buffer this is the payload length; otherwise it is the raw length.
/// Stored values carry no type tag, so a fixed-width value whose low four
/// bytes equal `len - 4` is reported as a prefixed payload: an i64 of 4 has
/// logical size 4, like a 4-byte string.
pub fn logical_size(raw: &[u8]) -> usize {
    if raw.len() >= LEN_PREFIX {
        let mut prefix = &raw[..LEN_PREFIX];
        let inner = prefix.get_u32_le() as usize;
        if LEN_PREFIX + inner == raw.len() {
            return inner;
        }
    }
    raw.len()
}

// =============================================================================
// Helpers
// =============================================================================

fn encode_list<'a>(items: impl Iterator<Item = &'a str>, count: usize, buf: &mut BytesMut) {
    buf.put_u32_le(count as u32);
    for item in items {
        item.encode_into(buf);
    }
}

fn list_len<'a>(items: impl Iterator<Item = &'a str>) -> usize {
    LEN_PREFIX + items.map(|s| LEN_PREFIX + s.len()).sum::<usize>()
}

fn read_prefixed<'a>(bytes: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if bytes.remaining() < LEN_PREFIX {
        return Err(MapKvError::Decode(format!("{}: missing length prefix", what)));
    }
    let len = bytes.get_u32_le() as usize;
    if bytes.remaining() < len {
        return Err(MapKvError::Decode(format!(
            "{}: expected {} bytes, got {}",
            what,
            len,
            bytes.remaining()
        )));
    }
    let current: &'a [u8] = *bytes;
    let (head, tail) = current.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn expect_consumed(bytes: &[u8], what: &str) -> Result<()> {
    if bytes.is_empty() {
        Ok(())
    } else {
        Err(MapKvError::Decode(format!(
            "{}: {} trailing bytes",
            what,
            bytes.len()
        )))
    }
}

fn utf8(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|e| MapKvError::Decode(e.to_string()))
}

fn size_mismatch(what: &str, expected: usize, got: usize) -> MapKvError {
    MapKvError::Decode(format!("{}: expected {} bytes, got {}", what, expected, got))
}
