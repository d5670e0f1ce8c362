//! Storage Module
//!
//! Durable, memory-mapped record storage for one store.
//!
//! ## Responsibilities
//! - Append encoded records to a mapped data file
//! - CRC-check content against the meta file on load
//! - Compact (full write-back) and grow the file geometrically when full
//! - Coordinate processes through advisory file locks
//!
//! ## Files (per store, in its root directory)
//! ```text
//! {id}         data file
//! ┌──────────────────┬──────────────────────────────────────────┐
//! │ ActualSize (4)   │ Records ... │ unused (zero / stale)       │
//! └──────────────────┴──────────────────────────────────────────┘
//!   length is a multiple of the page size
//!
//! {id}.crc     meta file (bincode MetaInfo)
//!   version | crc_digest | sequence | actual_size | iv | last_confirmed
//!
//! {id}.lock    advisory lock for multi-process mode
//! {id}.stage   transient copy of a full write-back, applied then removed
//! ```
//!
//! ## Append Ordering
//! record bytes → meta → header size. On load the header size is trusted
//! only when its CRC matches meta; otherwise meta's own size and then the
//! last confirmed size are tried, which rolls a torn append back.

mod file;
mod lock;
mod meta;
mod page_store;
mod staging;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub use file::MappedFile;
pub use lock::{FileLock, FileLockGuard};
pub use meta::{MetaFile, MetaInfo, META_VERSION};
pub use page_store::{OpenOptions, PageStore};
pub use staging::StagedWrite;

/// Size of the actual-size header at the start of the data file
pub const HEADER_SIZE: usize = 4;

/// File locations for a path-backed store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub data: PathBuf,
    pub meta: PathBuf,
    pub lock: PathBuf,
    pub stage: PathBuf,
}

impl StorePaths {
    /// Paths for `mmap_id` under `root`
    pub fn new(root: &Path, mmap_id: &str) -> Self {
        let name = file_name_for(mmap_id);
        Self {
            data: root.join(&name),
            meta: root.join(format!("{}.crc", name)),
            lock: root.join(format!("{}.lock", name)),
            stage: root.join(format!("{}.stage", name)),
        }
    }
}

/// Suffixes of a store's companion files
const RESERVED_SUFFIXES: [&str; 3] = [".crc", ".lock", ".stage"];

/// Prefix of hashed file names
const HASHED_PREFIX: &str = "id-";

/// File name for an ID.
///
/// IDs made of `[A-Za-z0-9._-]` (not starting with '.') are used as-is;
/// anything else is hashed so it cannot escape the root directory. IDs that
/// could name another store's companion or hashed file (a reserved suffix,
/// or the hashed prefix) are hashed too.
pub fn file_name_for(mmap_id: &str) -> String {
    let plain = !mmap_id.is_empty()
        && !mmap_id.starts_with('.')
        && !mmap_id.starts_with(HASHED_PREFIX)
        && !RESERVED_SUFFIXES.iter().any(|suffix| mmap_id.ends_with(suffix))
        && mmap_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if plain {
        return mmap_id.to_string();
    }

    let digest = Sha256::digest(mmap_id.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", HASHED_PREFIX, hex)
}

/// Round `len` up to a whole number of pages (at least one)
pub(crate) fn round_to_pages(len: usize, page_size: usize) -> usize {
    len.max(1).div_ceil(page_size) * page_size
}
