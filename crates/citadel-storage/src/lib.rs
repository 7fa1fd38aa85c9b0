//! Physical storage abstraction for Citadel.
//!
//! This crate defines the [`StorageBackend`] trait — a pure ordered key-value
//! interface that knows nothing about secrets, encryption, or engines. The
//! encryption barrier in `citadel-core` wraps a storage backend so that all
//! data is ciphertext by the time it reaches this layer.
//!
//! Two implementations are provided:
//!
//! - [`RedbBackend`] — persistent, backed by redb (pure Rust, B-tree based)
//! - [`MemoryBackend`] — in-memory, for testing
//!
//! The replicated store in `citadel-raft` implements the same trait on top of
//! its deterministic state machine, so the barrier is agnostic to whether it
//! is writing to a local file or a Raft-ordered log.

mod error;
mod memory;
mod redb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;

/// Maximum size of a single entry value, in bytes.
///
/// Larger writes are rejected with [`StorageError::EntryTooLarge`]. Callers
/// that need to persist larger blobs must chunk them above this layer.
pub const MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// The atomic physical record.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/keyring`,
/// `logical/<uuid>/data/myapp`). Values are opaque bytes. The `seal_wrap`
/// flag marks entries whose values must additionally round-trip through the
/// seal's key wrapper before hitting disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Unique storage key, lexicographically ordered for prefix listing.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Whether this entry requires seal wrapping in addition to the barrier.
    pub seal_wrap: bool,
}

impl Entry {
    /// Create a plain entry without seal wrapping.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: false,
        }
    }

    /// Create an entry flagged for seal wrapping.
    #[must_use]
    pub fn seal_wrapped(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: true,
        }
    }
}

/// A pluggable ordered key-value storage backend.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`)
/// and must list keys in lexicographic order.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// - [`StorageError::EntryTooLarge`] if the value exceeds [`MAX_ENTRY_SIZE`].
    /// - [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Idempotent — deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// List up to `limit` keys with the given prefix, strictly after `after`.
    ///
    /// Semantics follow the replicated store's pagination contract: keys are
    /// returned relative to the prefix, deeper keys collapse to their first
    /// segment with a trailing `/` (consecutive duplicates suppressed),
    /// `after` is an exclusive cursor, `limit < 0` means no limit and
    /// `limit == 0` returns an empty page. The default implementation folds
    /// the full listing; backends with seekable cursors should override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.list(prefix).await?;
        Ok(collapse_page(&keys, prefix, after, limit))
    }

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Fold a sorted full-key listing into one page of folder-collapsed keys.
///
/// Shared by the default [`StorageBackend::list_page`] implementation so
/// every backend paginates identically: keys relative to `prefix`, deeper
/// keys collapsed to `first-segment/`, consecutive duplicates suppressed,
/// entries at or before the exclusive `after` cursor skipped, and the page
/// truncated to `limit` when it is positive.
#[must_use]
pub fn collapse_page(full_keys: &[String], prefix: &str, after: &str, limit: i64) -> Vec<String> {
    let mut page: Vec<String> = Vec::new();
    for full in full_keys {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if limit > 0 && page.len() >= limit as usize {
            break;
        }
        let Some(key) = full.strip_prefix(prefix) else {
            continue;
        };
        if let Some(i) = key.find('/') {
            let folder = &key[..=i];
            if page.last().map(String::as_str) != Some(folder) {
                if !after.is_empty() && folder <= after {
                    continue;
                }
                page.push(folder.to_owned());
            }
        } else {
            if !after.is_empty() && key <= after {
                continue;
            }
            page.push(key.to_owned());
        }
    }
    page
}

/// Reject a value that exceeds [`MAX_ENTRY_SIZE`].
///
/// Shared by backends so the limit is enforced uniformly.
///
/// # Errors
///
/// Returns [`StorageError::EntryTooLarge`] when the value is oversized.
pub fn check_entry_size(key: &str, value: &[u8]) -> Result<(), StorageError> {
    if value.len() > MAX_ENTRY_SIZE {
        return Err(StorageError::EntryTooLarge {
            key: key.to_owned(),
            size: value.len(),
            limit: MAX_ENTRY_SIZE,
        });
    }
    Ok(())
}
