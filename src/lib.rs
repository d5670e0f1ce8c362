//! # MapKV
//!
//! An embedded, memory-mapped key-value store with:
//! - Typed values (bool, i64, f64, string, string list, bytes)
//! - CRC-checked, crash-safe appends and all-or-nothing compaction
//! - Optional AES-CTR encryption with re-keying
//! - Single- or multi-process access to the same files
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Registry                              │
//! │        (identity → live Store, hooks, configuration)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                         Store                                │
//! │        (typed API, reentrant in-process lock)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │    Codec    │          │  PageStore  │──── Crypt
//!   │  (values)   │          │   (mmap)    │──── file locks
//!   └─────────────┘          └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use mapkv::{Config, Registry, StoreMode};
//!
//! let registry = Registry::new(Config::builder().root_dir("/tmp/mapkv").build());
//! let store = registry.resolve("settings", StoreMode::SingleProcess, None, None)?;
//!
//! store.set_i64("launches", store.get_i64("launches", 0) + 1);
//! assert!(store.contains_key("launches"));
//! # Ok::<(), mapkv::MapKvError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

#[macro_use]
pub mod notify;

pub mod error;
pub mod config;

pub mod codec;
pub mod crypt;
pub mod storage;
pub mod registry;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{MapKvError, Result};
pub use config::{Config, LogLevel, StoreMode, SyncMode};
pub use codec::{Decode, Encode};
pub use notify::{ContentChangeListener, ErrorReporter, ErrorType, LogHandler, RecoverStrategy};
pub use registry::{Registry, StoreIdentity};
pub use store::{Store, StoreLockGuard};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of MapKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
