//! In-memory storage backend for testing.
//!
//! Stores all data in a `BTreeMap` behind an async `RwLock`. Not persistent —
//! all data is lost when the process exits. The sorted map makes prefix
//! listing and pagination match the persistent backends exactly, which is
//! what the barrier and FSM tests rely on.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{check_entry_size, StorageBackend, StorageError};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries. Test helper.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the backend holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_entry_size(key, value)?;
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_ENTRY_SIZE;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get("does/not/exist").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("core/keyring", b"hello").await.unwrap();
        let val = backend.get("core/keyring").await.unwrap();
        assert_eq!(val, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        let val = backend.get("key").await.unwrap();
        assert_eq!(val, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_nonexistent_is_noop() {
        let backend = MemoryBackend::new();
        backend.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_with_prefix_is_sorted() {
        let backend = MemoryBackend::new();
        backend.put("logical/a/data/b", b"1").await.unwrap();
        backend.put("logical/a/data/a", b"2").await.unwrap();
        backend.put("sys/token/id/x", b"3").await.unwrap();

        let keys = backend.list("logical/a/").await.unwrap();
        assert_eq!(keys, vec!["logical/a/data/a", "logical/a/data/b"]);
    }

    #[tokio::test]
    async fn list_no_matches_returns_empty() {
        let backend = MemoryBackend::new();
        backend.put("sys/config", b"1").await.unwrap();
        let keys = backend.list("logical/").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn list_page_respects_after_and_limit() {
        let backend = MemoryBackend::new();
        for i in 1..=6 {
            backend.put(&format!("p/{i}"), b"v").await.unwrap();
        }

        let page = backend.list_page("p/", "", 3).await.unwrap();
        assert_eq!(page, vec!["1", "2", "3"]);

        let page = backend.list_page("p/", "3", 3).await.unwrap();
        assert_eq!(page, vec!["4", "5", "6"]);

        let page = backend.list_page("p/", "6", 3).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn list_page_zero_limit_is_empty() {
        let backend = MemoryBackend::new();
        backend.put("p/1", b"v").await.unwrap();
        let page = backend.list_page("p/", "", 0).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn list_page_negative_limit_returns_all() {
        let backend = MemoryBackend::new();
        backend.put("p/1", b"v").await.unwrap();
        backend.put("p/2", b"v").await.unwrap();
        let page = backend.list_page("p/", "", -1).await.unwrap();
        assert_eq!(page, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn oversized_entry_rejected() {
        let backend = MemoryBackend::new();
        let big = vec![0u8; MAX_ENTRY_SIZE + 1];
        let err = backend.put("key", &big).await.unwrap_err();
        assert!(matches!(err, StorageError::EntryTooLarge { .. }));
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("key", b"val").await.unwrap();
        let val = clone.get("key").await.unwrap();
        assert_eq!(val, Some(b"val".to_vec()));
    }
}
