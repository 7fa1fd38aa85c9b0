//! Error types for `citadel-storage`.

/// Errors from a physical storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or create the backing store.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// A read operation failed.
    #[error("storage read failed for key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// A write operation failed.
    #[error("storage write failed for key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// A delete operation failed.
    #[error("storage delete failed for key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// A prefix listing failed.
    #[error("storage list failed for prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A transaction could not be started or committed.
    #[error("storage transaction failed: {reason}")]
    Transaction { reason: String },

    /// A required table was missing or could not be opened.
    #[error("storage table unavailable: {name}")]
    MissingTable { name: String },

    /// The value exceeds the maximum entry size.
    #[error("entry '{key}' too large: {size} bytes exceeds limit of {limit}")]
    EntryTooLarge { key: String, size: usize, limit: usize },
}
