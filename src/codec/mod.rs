//! Value Codec Module
//!
//! Compact binary encodings for typed values and for the key/value records
//! that make up a store's content.
//!
//! ## Value Encodings
//! The encoding is selected by the accessor that is called; values carry no
//! type tag.
//! ```text
//! bool         [u8]                      1 byte, 0 or 1
//! i64 / f64    [8 bytes LE]
//! string       [len u32 LE][utf-8 bytes]
//! bytes        [len u32 LE][raw bytes]
//! string list  [count u32 LE]([len u32 LE][utf-8 bytes])*
//! ```
//!
//! ## Record Framing
//! ```text
//! ┌──────────────┬─────────┬──────────────┬──────────────┐
//! │ KeyLen (4)   │   Key   │ ValLen (4)   │ Value        │
//! └──────────────┴─────────┴──────────────┴──────────────┘
//! ```
//! `ValLen == 0` marks a removed key.

mod record;
mod value;

pub use record::{encode_record, encode_removal, RecordIter, RecordRef, RECORD_OVERHEAD};
pub use value::{logical_size, Decode, Encode};

/// Size of every length prefix in the format
pub const LEN_PREFIX: usize = 4;
