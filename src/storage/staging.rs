//! Staged full write-backs
//!
//! A full write-back (compaction, trim, batch removal, re-key) rewrites the
//! data file in place. Before touching it, the complete new content and meta
//! are written to a staging file and fsynced, so a crash mid-rewrite can be
//! rolled forward on the next open.
//!
//! ## File Format
//! ```text
//! ┌───────────┬──────────┬────────────┬───────────┬──────────────┬─────────┐
//! │ "MKST"(4) │ CRC (4)  │ MetaLen(4) │ Meta      │ ContentLen(8)│ Content │
//! └───────────┴──────────┴────────────┴───────────┴──────────────┴─────────┘
//! ```
//! CRC covers everything after the CRC field.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use crate::error::{MapKvError, Result};

use super::MetaInfo;

const MAGIC: &[u8; 4] = b"MKST";

/// A complete content generation waiting to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWrite {
    pub meta: MetaInfo,
    /// On-disk (possibly encrypted) content bytes
    pub content: Vec<u8>,
}

impl StagedWrite {
    /// Write to `path` and fsync
    pub fn persist(&self, path: &Path) -> Result<()> {
        let meta = self.meta.to_bytes()?;

        let mut body = Vec::with_capacity(4 + meta.len() + 8 + self.content.len());
        body.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        body.extend_from_slice(&meta);
        body.extend_from_slice(&(self.content.len() as u64).to_le_bytes());
        body.extend_from_slice(&self.content);

        let crc = crc32fast::hash(&body);

        let mut file = File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a staged write; `Ok(None)` when no staging file exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        if raw.len() < 8 || &raw[0..4] != MAGIC {
            return Err(MapKvError::Staging("bad magic or truncated header".to_string()));
        }

        let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let body = &raw[8..];
        if crc32fast::hash(body) != crc {
            return Err(MapKvError::Staging("checksum mismatch".to_string()));
        }

        let truncated = || MapKvError::Staging("truncated body".to_string());

        let meta_len = body
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(truncated)?;
        let meta_bytes = body.get(4..4 + meta_len).ok_or_else(truncated)?;
        let meta = MetaInfo::from_bytes(meta_bytes)?;

        let content_at = 4 + meta_len;
        let content_len = body
            .get(content_at..content_at + 8)
            .map(|b| {
                let mut len = [0u8; 8];
                len.copy_from_slice(b);
                u64::from_le_bytes(len) as usize
            })
            .ok_or_else(truncated)?;
        let content = body
            .get(content_at + 8..content_at + 8 + content_len)
            .ok_or_else(truncated)?
            .to_vec();

        Ok(Some(Self { meta, content }))
    }

    /// Remove the staging file; a missing file is fine
    pub fn discard(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
