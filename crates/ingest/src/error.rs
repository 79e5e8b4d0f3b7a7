//! Error types for catalog access.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reading, locking or writing the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The advisory lock stayed held by another process past the bound.
    #[error("lock_timeout: could not lock {path} within {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The catalog file exists but does not parse.
    #[error("catalog {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize catalog: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A write would replace a different asset under the same key.
    #[error("conflict: key {key} already holds a different asset")]
    Conflict { key: String },

    #[error("failed to scan {dir}: {message}")]
    Scan { dir: PathBuf, message: String },

    #[error("no catalog entry for key {0}")]
    UnknownKey(String),
}

impl CatalogError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CatalogError::Io { context: context.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
