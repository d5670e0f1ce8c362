//! Record framing
//!
//! Encodes single key/value records and walks a run of them.

use bytes::{BufMut, BytesMut};

use crate::error::{MapKvError, Result};

use super::LEN_PREFIX;

/// Fixed bytes per record: key length + value length
pub const RECORD_OVERHEAD: usize = 2 * LEN_PREFIX;

/// Encode a `key → value` record
pub fn encode_record(key: &str, value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key.as_bytes());
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
    buf
}

/// Encode a removal marker for `key` (a record with an empty value)
pub fn encode_removal(key: &str) -> BytesMut {
    encode_record(key, &[])
}

/// A record borrowed from a content buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
}

impl RecordRef<'_> {
    /// Whether this record removes its key
    pub fn is_removal(&self) -> bool {
        self.value.is_empty()
    }
}

/// Iterator over consecutive records.
///
/// Stops after the first malformed record; `position()` then points at the
/// start of that record, so the well-formed prefix is `content[..position()]`.
pub struct RecordIter<'a> {
    content: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self {
            content,
            pos: 0,
            failed: false,
        }
    }

    /// Offset of the next unread record
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_len(&self, at: usize) -> Option<usize> {
        let raw = self.content.get(at..at + LEN_PREFIX)?;
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn parse_at(&self, start: usize) -> Result<(RecordRef<'a>, usize)> {
        let truncated = || MapKvError::Decode(format!("truncated record at offset {}", start));

        let key_len = self.read_len(start).ok_or_else(truncated)?;
        let key_start = start + LEN_PREFIX;
        let key_end = key_start
            .checked_add(key_len)
            .filter(|end| *end <= self.content.len())
            .ok_or_else(truncated)?;

        if key_len == 0 {
            return Err(MapKvError::Decode(format!("empty key at offset {}", start)));
        }
        let key = std::str::from_utf8(&self.content[key_start..key_end])
            .map_err(|e| MapKvError::Decode(format!("key at offset {}: {}", start, e)))?;

        let val_len = self.read_len(key_end).ok_or_else(truncated)?;
        let val_start = key_end + LEN_PREFIX;
        let val_end = val_start
            .checked_add(val_len)
            .filter(|end| *end <= self.content.len())
            .ok_or_else(truncated)?;

        let record = RecordRef {
            key,
            value: &self.content[val_start..val_end],
        };
        Ok((record, val_end))
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<RecordRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.content.len() {
            return None;
        }

        match self.parse_at(self.pos) {
            Ok((record, next)) => {
                self.pos = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
