//! Memory-mapped data file
//!
//! Wraps the data file and its writable mapping. The mapping can be dropped
//! (`unmap`) while the file stays open, so advisory locks held on the
//! descriptor survive a memory-cache purge.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::config::SyncMode;
use crate::error::{MapKvError, Result};

/// A data file and its (optional) writable mapping
#[derive(Debug)]
pub struct MappedFile {
    file: File,
    mmap: Option<MmapMut>,
    len: usize,
}

impl MappedFile {
    /// Open or create the file at `path`, growing it to at least `min_len`
    pub fn open(path: &Path, min_len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(file, min_len)
    }

    /// Wrap an already-open descriptor, growing it to at least `min_len`
    pub fn from_file(file: File, min_len: usize) -> Result<Self> {
        let mut len = file.metadata()?.len() as usize;
        if len < min_len {
            file.set_len(min_len as u64)?;
            len = min_len;
        }

        let mut mapped = Self {
            file,
            mmap: None,
            len,
        };
        mapped.map()?;
        Ok(mapped)
    }

    /// Map the file if it is not mapped, picking up its current length
    pub fn map(&mut self) -> Result<()> {
        if self.mmap.is_some() {
            return Ok(());
        }

        self.len = self.file.metadata()?.len() as usize;
        if self.len == 0 {
            return Err(MapKvError::Storage("cannot map an empty data file".to_string()));
        }

        // SAFETY: the mapping may be changed by another process sharing the
        // file. All access goes through bytes()/bytes_mut(), which are bounded
        // by `len`, and callers re-check the on-disk length (remap_if_resized)
        // under the inter-process lock before touching the mapping.
        let mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    /// Drop the mapping, keeping the descriptor open
    pub fn unmap(&mut self) {
        self.mmap = None;
    }

    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Remap when another process changed the file length.
    ///
    /// Returns true if the length changed.
    pub fn remap_if_resized(&mut self) -> Result<bool> {
        let on_disk = self.file.metadata()?.len() as usize;
        if on_disk == self.len && self.mmap.is_some() {
            return Ok(false);
        }
        self.mmap = None;
        self.map()?;
        Ok(true)
    }

    /// Change the file length and remap
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        self.file.set_len(new_len as u64)?;
        self.map()
    }

    /// Current mapped length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        self.mmap
            .as_deref()
            .ok_or_else(|| MapKvError::Storage("data file is not mapped".to_string()))
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.mmap
            .as_deref_mut()
            .ok_or_else(|| MapKvError::Storage("data file is not mapped".to_string()))
    }

    /// Flush dirty pages; `Async` schedules the write-back and returns
    pub fn flush(&self, mode: SyncMode) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            match mode {
                SyncMode::Sync => mmap.flush()?,
                SyncMode::Async => mmap.flush_async()?,
            }
        }
        Ok(())
    }

    /// Underlying descriptor
    pub fn file(&self) -> &File {
        &self.file
    }
}
