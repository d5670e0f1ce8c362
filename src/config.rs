//! Configuration for MapKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// Main configuration for a [`Registry`](crate::Registry)
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Default root directory for stores opened without an explicit root.
    /// Internal structure:
    ///   {root_dir}/
    ///     ├── {mmap_id}          (data file)
    ///     ├── {mmap_id}.crc      (meta file)
    ///     ├── {mmap_id}.lock     (advisory lock file)
    ///     └── {mmap_id}.stage    (pending full rewrite, transient)
    pub root_dir: PathBuf,

    /// Minimum data file size and growth granule (in bytes)
    pub page_size: usize,

    /// ID used by `Registry::default_store`
    pub default_mmap_id: String,

    // -------------------------------------------------------------------------
    // Logging Configuration
    // -------------------------------------------------------------------------
    /// Threshold for engine log lines
    pub log_level: LogLevel,
}

/// How a store may be shared between processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Only this process touches the backing files
    SingleProcess,

    /// Several processes share the backing files; mutations take an
    /// advisory file lock and each access reconciles with the meta file
    MultiProcess,
}

/// Flush behavior for `Store::sync`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Block until the mapped pages and meta file are on stable storage
    Sync,

    /// Schedule the flush and return immediately
    Async,
}

/// Engine log levels, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    None = 4,
}

impl LogLevel {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }
}

/// Default page size: one 4 KiB page
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default store ID
pub const DEFAULT_MMAP_ID: &str = "mapkv.default";

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./mapkv_data"),
            page_size: DEFAULT_PAGE_SIZE,
            default_mmap_id: DEFAULT_MMAP_ID.to_string(),
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the default root directory
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_dir = path.into();
        self
    }

    /// Set the page size (rounded up to a multiple of 4 KiB at build time)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the ID used for the default store
    pub fn default_mmap_id(mut self, id: impl Into<String>) -> Self {
        self.config.default_mmap_id = id.into();
        self
    }

    /// Set the engine log threshold
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn build(mut self) -> Config {
        self.config.page_size = normalize_page_size(self.config.page_size);
        self.config
    }
}

/// Round a page size up to a whole number of 4 KiB pages (at least one)
pub fn normalize_page_size(size: usize) -> usize {
    size.max(DEFAULT_PAGE_SIZE).div_ceil(DEFAULT_PAGE_SIZE) * DEFAULT_PAGE_SIZE
}
