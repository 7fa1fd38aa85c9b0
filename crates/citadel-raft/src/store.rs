//! The apply pipeline exposed as a storage backend.
//!
//! [`RaftStore`] owns commit ordering: every write becomes a log entry with
//! a monotonically increasing index and is applied through the state
//! machine, so the barrier above persists into totally ordered, replicated
//! storage. On a single node the pipeline degenerates to "assign the next
//! index and apply"; a consensus layer replaces the index assignment with
//! replicated commit without touching the FSM contract.
//!
//! Reads go straight to the state machine. The FSM's redb calls are
//! synchronous, so everything here hops through the blocking pool.

use std::sync::Arc;

use citadel_storage::{check_entry_size, StorageBackend, StorageError};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::RaftError;
use crate::fsm::{ApplyResponse, Fsm};
use crate::log::{LogBody, LogData, LogEntry, Operation};

/// Storage backend that routes writes through log application.
pub struct RaftStore {
    fsm: Arc<Fsm>,
    /// Next (term, index) to assign. Guarded by a mutex so concurrently
    /// submitted operations receive distinct, ordered commit indexes.
    cursor: Mutex<(u64, u64)>,
}

impl std::fmt::Debug for RaftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftStore")
            .field("fsm", &self.fsm)
            .finish_non_exhaustive()
    }
}

impl RaftStore {
    /// Wrap a state machine, resuming the index cursor from its latest
    /// applied position.
    #[must_use]
    pub fn new(fsm: Arc<Fsm>) -> Self {
        let (latest, _) = fsm.latest_state();
        let term = latest.term.max(1);
        Self {
            fsm,
            cursor: Mutex::new((term, latest.index)),
        }
    }

    /// The wrapped state machine.
    #[must_use]
    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    fn next_entry(&self, data: LogData) -> LogEntry {
        let mut cursor = self.cursor.lock();
        cursor.1 += 1;
        LogEntry {
            index: cursor.1,
            term: cursor.0,
            body: LogBody::Command(data),
        }
    }

    /// Apply one command through the log.
    ///
    /// # Errors
    ///
    /// Propagates [`RaftError`] from the state machine; fatal errors mean
    /// the node must stop serving.
    pub async fn apply(&self, data: LogData) -> Result<ApplyResponse, RaftError> {
        let entry = self.next_entry(data);
        let index = entry.index;
        let fsm = Arc::clone(&self.fsm);
        let mut responses = tokio::task::spawn_blocking(move || fsm.apply_batch(&[entry]))
            .await
            .map_err(|e| RaftError::Store {
                reason: format!("apply task panicked: {e}"),
            })??;
        debug!(index, "log entry applied");
        responses.pop().ok_or_else(|| RaftError::Store {
            reason: "apply returned no response".to_owned(),
        })
    }

    /// Apply a transaction: wraps `ops` in `begin_tx`/`commit_tx` and maps a
    /// verify failure to [`RaftError::TransactionCommitFailure`] so callers
    /// can retry on conflict.
    ///
    /// # Errors
    ///
    /// - [`RaftError::TransactionCommitFailure`] when a verify op failed.
    /// - Other [`RaftError`] values on store failure.
    pub async fn transaction(&self, ops: Vec<Operation>) -> Result<(), RaftError> {
        let mut operations = Vec::with_capacity(ops.len() + 2);
        operations.push(Operation::begin_tx());
        operations.extend(ops);
        operations.push(Operation::commit_tx());

        let response = self.apply(LogData::new(operations)).await?;
        match response.tx_error {
            None => Ok(()),
            Some(reason) => Err(RaftError::TransactionCommitFailure { reason }),
        }
    }

    /// Paged folder listing, relative to the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] on store failure.
    pub async fn list_folder_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let prefix = prefix.to_owned();
        let after = after.to_owned();
        tokio::task::spawn_blocking(move || fsm.list_page(&prefix, &after, limit))
            .await
            .map_err(|e| StorageError::List {
                prefix: String::new(),
                reason: format!("blocking task panicked: {e}"),
            })?
            .map_err(|e| StorageError::List {
                prefix: String::new(),
                reason: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RaftStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let owned = key.clone();
            fsm.get(&owned).map_err(move |e| StorageError::Read {
                key,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_entry_size(key, value)?;
        self.apply(LogData::new(vec![Operation::put(key, value.to_vec())]))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Write {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.apply(LogData::new(vec![Operation::delete(key)]))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let owned = prefix.clone();
            fsm.list_prefix(&owned).map_err(move |e| StorageError::List {
                prefix,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        self.list_folder_page(prefix, after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, RaftStore) {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Arc::new(Fsm::open(dir.path().join("fsm.redb")).unwrap());
        (dir, RaftStore::new(fsm))
    }

    #[tokio::test]
    async fn backend_roundtrip_through_log() {
        let (_dir, store) = open_store();
        store.put("core/keyring", b"ciphertext").await.unwrap();
        assert_eq!(
            store.get("core/keyring").await.unwrap(),
            Some(b"ciphertext".to_vec())
        );
        store.delete("core/keyring").await.unwrap();
        assert_eq!(store.get("core/keyring").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_advance_commit_index() {
        let (_dir, store) = open_store();
        store.put("a", b"1").await.unwrap();
        store.put("b", b"2").await.unwrap();
        let (latest, _) = store.fsm().latest_state();
        assert_eq!(latest.index, 2);
    }

    #[tokio::test]
    async fn cursor_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsm.redb");
        {
            let store = RaftStore::new(Arc::new(Fsm::open(&path).unwrap()));
            store.put("a", b"1").await.unwrap();
        }
        let store = RaftStore::new(Arc::new(Fsm::open(&path).unwrap()));
        store.put("b", b"2").await.unwrap();
        let (latest, _) = store.fsm().latest_state();
        assert_eq!(latest.index, 2);
    }

    #[tokio::test]
    async fn transaction_conflict_surfaces_commit_failure() {
        let (_dir, store) = open_store();
        store.put("a", b"1").await.unwrap();

        store
            .transaction(vec![
                Operation::verify_read("a", Some(b"1".to_vec())),
                Operation::put("a", b"2".to_vec()),
            ])
            .await
            .unwrap();

        let err = store
            .transaction(vec![
                Operation::verify_read("a", Some(b"1".to_vec())),
                Operation::put("a", b"3".to_vec()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::TransactionCommitFailure { .. }));
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn folder_page_listing() {
        let (_dir, store) = open_store();
        store.put("m/a", b"1").await.unwrap();
        store.put("m/sub/x", b"2").await.unwrap();
        store.put("m/z", b"3").await.unwrap();

        let page = store.list_page("m/", "", -1).await.unwrap();
        assert_eq!(page, vec!["a", "sub/", "z"]);
    }
}
