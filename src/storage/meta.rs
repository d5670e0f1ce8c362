//! Meta file
//!
//! Small side file holding the content checksum, size, write-back sequence
//! and cipher IV for a data file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypt::IV_LEN;
use crate::error::Result;

/// Current meta format version; 0 means "no meta written yet"
pub const META_VERSION: u32 = 1;

/// Content description stored in the meta file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    pub version: u32,

    /// CRC-32 of the on-disk content bytes (`data[4..4 + actual_size]`)
    pub crc_digest: u32,

    /// Bumped on every full write-back and clear; other processes reload
    /// from scratch when it moves
    pub sequence: u32,

    pub actual_size: u64,

    /// Cipher IV for the current content generation
    pub iv: [u8; IV_LEN],

    /// Size/CRC before the most recent append
    pub last_confirmed_size: u64,
    pub last_confirmed_crc: u32,
}

impl MetaInfo {
    /// Meta for a fresh, empty content generation
    pub fn fresh(sequence: u32, iv: [u8; IV_LEN]) -> Self {
        Self {
            version: META_VERSION,
            sequence,
            iv,
            ..Self::default()
        }
    }

    /// Whether a meta record has ever been written
    pub fn is_initialized(&self) -> bool {
        self.version != 0
    }

    /// Encoded size in bytes (fixed: every field is fixed-width)
    pub fn encoded_len() -> usize {
        // version + crc + sequence + actual_size + iv + confirmed size + confirmed crc
        4 + 4 + 4 + 8 + IV_LEN + 8 + 4
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Handle on a store's meta file
#[derive(Debug)]
pub struct MetaFile {
    file: File,
}

impl MetaFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    /// Read the meta record; a short or empty file yields the default
    /// (uninitialized) record
    pub fn read(&self) -> Result<MetaInfo> {
        read_meta(&self.file)
    }

    pub fn write(&self, meta: &MetaInfo) -> Result<()> {
        let bytes = meta.to_bytes()?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Read a meta record from any open file
pub fn read_meta(file: &File) -> Result<MetaInfo> {
    let mut buf = vec![0u8; MetaInfo::encoded_len()];
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;

    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < buf.len() {
        return Ok(MetaInfo::default());
    }
    MetaInfo::from_bytes(&buf)
}
