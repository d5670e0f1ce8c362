//! Error types for MapKV
//!
//! Provides a unified error type for all internal operations. The public
//! [`Store`](crate::Store) API converts these into return-value sentinels.

use thiserror::Error;

/// Result type alias using MapKvError
pub type Result<T> = std::result::Result<T, MapKvError>;

/// Unified error type for MapKV operations
#[derive(Debug, Error)]
pub enum MapKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("storage error: {0}")]
    Storage(String),

    #[error("staging file invalid: {0}")]
    Staging(String),

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Handle Errors
    // -------------------------------------------------------------------------
    #[error("invalid key")]
    InvalidKey,
}

impl From<bincode::Error> for MapKvError {
    fn from(e: bincode::Error) -> Self {
        MapKvError::Serialization(e.to_string())
    }
}
