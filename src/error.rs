//! Error types for the pagekit kernel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// The durable record store could not be opened (storage disabled,
    /// locked by another process, corrupt path). Under a permissive
    /// configuration this degrades to a null handle instead.
    #[error("record store unavailable")]
    StorageUnavailable,

    /// Requested cache key absent: directory miss or orphaned record.
    /// Always recoverable; callers fall back to the network.
    #[error("not cached: {0}")]
    NotFound(String),

    /// Network or HTTP-status failure while retrieving a file.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// A DOM observer with this name or query is already registered.
    /// Programmer error; surfaces during development.
    #[error("duplicate observer registration: {0}")]
    DuplicateObserver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
