//! Error types for the key-value store
//!
//! Provides unified error handling using thiserror.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// == KV Error Enum ==
/// Unified error type for every store operation.
///
/// Each variant aborts the current operation only. Locks are released by
/// their guards before the error reaches the caller.
#[derive(Error, Debug)]
pub enum KvError {
    /// The storage log could not be opened, read, written or replaced
    #[error("Storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A cross-process lock was not obtained within the configured bound
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// No live record exists for the key
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key or value does not fit the fixed record layout
    #[error("{field} is {len} bytes, maximum is {max}")]
    RecordTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Key cannot be represented in the record layout
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value cannot be represented in the record layout
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A full-size record in the log could not be decoded
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// The shared cache segment could not be opened or mapped
    #[error("Cache unavailable at {path}: {reason}")]
    CacheUnavailable { path: PathBuf, reason: String },
}

impl KvError {
    /// Wraps an I/O failure on the storage log.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        KvError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Wraps a failure to open or map the cache segment.
    pub fn cache(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        KvError::CacheUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the store.
pub type Result<T> = std::result::Result<T, KvError>;
