//! Error types for cache persistence

/// Failures reported by a `BlobStore` backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No blob under this key. May be transient right after a first write.
    #[error("no cache blob for {0}")]
    NotFound(String),

    /// Someone else wrote the blob since it was read.
    #[error("cache blob for {0} was modified concurrently")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from cache load/save.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cache serialization failed: {0}")]
    Serialization(String),
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
