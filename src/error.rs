//! Error types for duraheap.

use thiserror::Error;

/// Result type alias using duraheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for duraheap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Runtime configuration rejected (page size / chunk size mismatch,
    /// oversized capacity request).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The datastore does not exist at the given path.
    #[error("datastore not found: {0}")]
    NotFound(String),

    /// The datastore was not closed properly in its previous session.
    #[error("datastore is inconsistent (missing properly-closed mark): {0}")]
    Inconsistent(String),

    /// The kernel could not reserve or place a virtual-memory range.
    #[error("address space failure: {0}")]
    AddressSpace(String),

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid segment operation (read-only mutation, growth past the cap).
    #[error("invalid segment operation: {0}")]
    InvalidSegment(String),

    /// Metadata (de)serialization failed.
    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
