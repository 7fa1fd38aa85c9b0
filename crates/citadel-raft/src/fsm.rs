//! The deterministic state machine behind the replicated store.
//!
//! Committed log entries are applied in batches into an embedded redb
//! database with two tables: `data` (user entries, all ciphertext by the
//! time it arrives here) and `config` (state-machine metadata: latest
//! applied index/term, latest cluster configuration, and the node-local
//! suffrage record).
//!
//! Each batch is applied inside a single write transaction. Entries that
//! form a transaction (`begin_tx` ... `commit_tx`) are pre-verified against
//! the store state as of their turn in the batch — prior entries' writes are
//! visible, the transaction's own writes are not — and rejected wholesale
//! with a commit-failure result if any verify fails. The surrounding batch
//! keeps going; rejection is a per-entry outcome, not a batch error.
//!
//! Plain put/delete failures are different: the log is already committed, so
//! a node that cannot apply it has diverged and must stop serving. Those
//! surface as [`RaftError::Fatal`].

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{error, info, warn};

use crate::error::RaftError;
use crate::log::{
    ConfigurationValue, IndexValue, LocalNodeConfig, LogBody, LogData, LogEntry, OpType,
    VerifyListExpectation,
};

/// User entries. Keys are the barrier's storage keys, values ciphertext.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// State-machine metadata.
const CONFIG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

const LATEST_INDEX_KEY: &str = "latest_index";
const LATEST_CONFIG_KEY: &str = "latest_config";
const LOCAL_NODE_CONFIG_KEY: &str = "local_node_config";

/// The per-entry outcome of a batch apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResponse {
    /// Log index of the entry this outcome belongs to.
    pub index: u64,
    /// `Some` when the entry was a transaction that failed its verify set.
    /// The transaction's writes were discarded.
    pub tx_error: Option<String>,
}

/// Callback invoked after a snapshot restore (or a `restore_callback` op).
pub type RestoreCallback = Box<dyn Fn() + Send + Sync>;

/// The deterministic state machine over redb.
///
/// All methods are synchronous; async callers go through
/// [`RaftStore`](crate::store::RaftStore), which offloads to the blocking
/// pool.
pub struct Fsm {
    /// `None` only transiently, while a snapshot install swaps the file.
    db: RwLock<Option<Database>>,
    path: PathBuf,
    latest: Mutex<IndexValue>,
    latest_config: Mutex<ConfigurationValue>,
    restore_cb: Mutex<Option<RestoreCallback>>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("path", &self.path)
            .field("latest", &*self.latest.lock())
            .finish_non_exhaustive()
    }
}

impl Fsm {
    /// Open or create the state machine's database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path)?;

        let fsm = Self {
            db: RwLock::new(Some(db)),
            path,
            latest: Mutex::new(IndexValue::default()),
            latest_config: Mutex::new(ConfigurationValue::default()),
            restore_cb: Mutex::new(None),
        };
        fsm.reload_metadata()?;
        Ok(fsm)
    }

    /// Register the callback fired after a snapshot restore.
    pub fn set_restore_callback(&self, cb: RestoreCallback) {
        *self.restore_cb.lock() = Some(cb);
    }

    /// The filesystem path of the backing database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest applied index/term and latest cluster configuration.
    #[must_use]
    pub fn latest_state(&self) -> (IndexValue, ConfigurationValue) {
        (*self.latest.lock(), self.latest_config.lock().clone())
    }

    /// Read the node-local suffrage record.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] on database failure.
    pub fn local_node_config(&self) -> Result<Option<LocalNodeConfig>, RaftError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_read().map_err(RaftError::store)?;
        let table = txn.open_table(CONFIG_TABLE).map_err(RaftError::store)?;
        let Some(raw) = table
            .get(LOCAL_NODE_CONFIG_KEY)
            .map_err(RaftError::store)?
            .map(|v| v.value().to_vec())
        else {
            return Ok(None);
        };
        let config = serde_json::from_slice(&raw).map_err(RaftError::store)?;
        Ok(Some(config))
    }

    /// Record this node's intended suffrage. Preserved across snapshot
    /// installs so a restored non-voter does not silently become a voter.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] on database failure.
    pub fn set_local_node_config(&self, config: &LocalNodeConfig) -> Result<(), RaftError> {
        let raw = serde_json::to_vec(config).map_err(RaftError::store)?;
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_write().map_err(RaftError::store)?;
        {
            let mut table = txn.open_table(CONFIG_TABLE).map_err(RaftError::store)?;
            table
                .insert(LOCAL_NODE_CONFIG_KEY, raw.as_slice())
                .map_err(RaftError::store)?;
        }
        txn.commit().map_err(RaftError::store)?;
        Ok(())
    }

    /// Read a key from the `data` table.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] on database failure.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RaftError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_read().map_err(RaftError::store)?;
        let table = txn.open_table(DATA_TABLE).map_err(RaftError::store)?;
        Ok(table
            .get(key)
            .map_err(RaftError::store)?
            .map(|v| v.value().to_vec()))
    }

    /// Recursive listing of full keys under a prefix, in order.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] on database failure.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, RaftError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_read().map_err(RaftError::store)?;
        let table = txn.open_table(DATA_TABLE).map_err(RaftError::store)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..).map_err(RaftError::store)? {
            let (k, _) = item.map_err(RaftError::store)?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_owned());
        }
        Ok(keys)
    }

    /// Paged folder listing under a prefix.
    ///
    /// Keys are returned relative to the prefix; keys with further `/`
    /// segments collapse to their first segment with a trailing `/`, with
    /// consecutive duplicates suppressed. `after` is an exclusive cursor
    /// (the last key of the previous page); `limit < 0` means unbounded and
    /// `limit == 0` returns an empty page. The cursor seek starts at
    /// `prefix + after` so pagination cost is proportional to the page, not
    /// the folder.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Store`] on database failure.
    pub fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, RaftError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_read().map_err(RaftError::store)?;
        let table = txn.open_table(DATA_TABLE).map_err(RaftError::store)?;
        list_page_in(&table, prefix, after, limit)
    }

    /// Apply a batch of committed log entries.
    ///
    /// One write transaction covers the whole batch; results come back in
    /// entry order. A transaction entry whose verify set fails produces a
    /// response with `tx_error` set and its writes discarded — the batch
    /// continues. A plain write that fails is a divergence and returns
    /// [`RaftError::Fatal`], aborting the whole batch.
    ///
    /// # Errors
    ///
    /// - [`RaftError::Fatal`] on non-transactional apply failure.
    /// - [`RaftError::Store`] on database failure.
    pub fn apply_batch(&self, entries: &[LogEntry]) -> Result<Vec<ApplyResponse>, RaftError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut responses = Vec::with_capacity(entries.len());
        let mut fire_restore_cb = false;
        let mut new_config: Option<ConfigurationValue> = None;

        let last = entries
            .last()
            .map(|e| IndexValue {
                term: e.term,
                index: e.index,
            })
            .unwrap_or_default();

        {
            let guard = self.db.read();
            let db = guard.as_ref().ok_or_else(db_closed)?;
            let txn = db.begin_write().map_err(RaftError::store)?;
            {
                let mut data = txn.open_table(DATA_TABLE).map_err(RaftError::store)?;
                let mut config = txn.open_table(CONFIG_TABLE).map_err(RaftError::store)?;

                for entry in entries {
                    match &entry.body {
                        LogBody::Command(command) => {
                            let outcome = if command.is_transaction() {
                                apply_tx_entry(&mut data, command)
                            } else {
                                apply_plain_entry(&mut data, command, &mut fire_restore_cb)
                            };
                            match outcome {
                                Ok(()) => responses.push(ApplyResponse {
                                    index: entry.index,
                                    tx_error: None,
                                }),
                                Err(RaftError::TransactionCommitFailure { reason }) => {
                                    responses.push(ApplyResponse {
                                        index: entry.index,
                                        tx_error: Some(reason),
                                    });
                                }
                                Err(e) => {
                                    error!(index = entry.index, error = %e, "apply failed");
                                    return Err(e);
                                }
                            }
                        }
                        LogBody::Configuration(cfg) => {
                            new_config = Some(cfg.clone());
                            responses.push(ApplyResponse {
                                index: entry.index,
                                tx_error: None,
                            });
                        }
                    }
                }

                // Advance the latest pointer only forward.
                let latest = *self.latest.lock();
                if last.index > latest.index {
                    let raw = serde_json::to_vec(&last).map_err(RaftError::store)?;
                    config
                        .insert(LATEST_INDEX_KEY, raw.as_slice())
                        .map_err(RaftError::store)?;
                }
                if let Some(ref cfg) = new_config {
                    let raw = serde_json::to_vec(cfg).map_err(RaftError::store)?;
                    config
                        .insert(LATEST_CONFIG_KEY, raw.as_slice())
                        .map_err(RaftError::store)?;
                }
            }
            txn.commit().map_err(RaftError::store)?;
        }

        {
            let mut latest = self.latest.lock();
            if last.index > latest.index {
                *latest = last;
            }
        }
        if let Some(cfg) = new_config {
            *self.latest_config.lock() = cfg;
        }

        if fire_restore_cb {
            if let Some(cb) = self.restore_cb.lock().as_ref() {
                cb();
            }
        }

        Ok(responses)
    }

    /// Reload in-memory metadata from the `config` table.
    pub(crate) fn reload_metadata(&self) -> Result<(), RaftError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(db_closed)?;
        let txn = db.begin_read().map_err(RaftError::store)?;
        let table = txn.open_table(CONFIG_TABLE).map_err(RaftError::store)?;

        if let Some(raw) = table
            .get(LATEST_INDEX_KEY)
            .map_err(RaftError::store)?
            .map(|v| v.value().to_vec())
        {
            *self.latest.lock() = serde_json::from_slice(&raw).map_err(RaftError::store)?;
        }
        if let Some(raw) = table
            .get(LATEST_CONFIG_KEY)
            .map_err(RaftError::store)?
            .map(|v| v.value().to_vec())
        {
            *self.latest_config.lock() = serde_json::from_slice(&raw).map_err(RaftError::store)?;
        }
        Ok(())
    }

    pub(crate) fn with_db_swapped<R>(
        &self,
        f: impl FnOnce(&mut Option<Database>, &Path) -> Result<R, RaftError>,
    ) -> Result<R, RaftError> {
        let mut guard = self.db.write();
        f(&mut guard, &self.path)
    }

    pub(crate) fn fire_restore_callback(&self) {
        if let Some(cb) = self.restore_cb.lock().as_ref() {
            info!("running post-restore callback");
            cb();
        }
    }
}

pub(crate) fn open_database(path: &Path) -> Result<Database, RaftError> {
    let db = Database::create(path).map_err(|e| RaftError::Store {
        reason: format!("failed to open fsm database at {}: {e}", path.display()),
    })?;
    let txn = db.begin_write().map_err(RaftError::store)?;
    {
        let _ = txn.open_table(DATA_TABLE).map_err(RaftError::store)?;
        let _ = txn.open_table(CONFIG_TABLE).map_err(RaftError::store)?;
    }
    txn.commit().map_err(RaftError::store)?;
    Ok(db)
}

fn db_closed() -> RaftError {
    RaftError::Store {
        reason: "database is closed (snapshot install in progress)".to_owned(),
    }
}

/// Apply a non-transactional command. Write failures are fatal.
fn apply_plain_entry<T>(
    data: &mut T,
    command: &LogData,
    fire_restore_cb: &mut bool,
) -> Result<(), RaftError>
where
    T: WritableData,
{
    command.validate_shape()?;
    for op in &command.operations {
        match op.op_type {
            OpType::Put => {
                let value = op.value.as_deref().unwrap_or_default();
                data.put(&op.key, value).map_err(|e| RaftError::Fatal {
                    reason: format!("put '{}' failed: {e}", op.key),
                })?;
            }
            OpType::Delete => {
                data.remove(&op.key).map_err(|e| RaftError::Fatal {
                    reason: format!("delete '{}' failed: {e}", op.key),
                })?;
            }
            OpType::RestoreCallback => {
                *fire_restore_cb = true;
            }
            OpType::VerifyRead | OpType::VerifyList => {
                // Verify ops are only meaningful inside a transaction.
                warn!(op = ?op.op_type, key = %op.key, "verify op outside transaction ignored");
            }
            OpType::BeginTx | OpType::CommitTx => unreachable!("rejected by validate_shape"),
        }
    }
    Ok(())
}

/// Apply a transaction: every verify checked before any write.
fn apply_tx_entry<T>(data: &mut T, command: &LogData) -> Result<(), RaftError>
where
    T: WritableData,
{
    command.validate_shape()?;

    // Verify pass — no writes yet, so every check sees pre-transaction state.
    for op in &command.operations {
        match op.op_type {
            OpType::VerifyRead => {
                let current = data.read(&op.key).map_err(RaftError::store)?;
                if current != op.value {
                    return Err(RaftError::TransactionCommitFailure {
                        reason: format!("verify_read failed for key '{}'", op.key),
                    });
                }
            }
            OpType::VerifyList => {
                let raw = op.value.as_deref().unwrap_or_default();
                let expectation: VerifyListExpectation =
                    serde_json::from_slice(raw).map_err(|e| {
                        RaftError::TransactionCommitFailure {
                            reason: format!("verify_list expectation undecodable: {e}"),
                        }
                    })?;
                let actual =
                    data.page(&op.key, &expectation.after, expectation.limit)?;
                if actual != expectation.keys {
                    return Err(RaftError::TransactionCommitFailure {
                        reason: format!("verify_list failed for prefix '{}'", op.key),
                    });
                }
            }
            _ => {}
        }
    }

    // Write pass.
    for op in &command.operations {
        match op.op_type {
            OpType::Put => {
                let value = op.value.as_deref().unwrap_or_default();
                data.put(&op.key, value).map_err(|e| RaftError::Fatal {
                    reason: format!("tx put '{}' failed: {e}", op.key),
                })?;
            }
            OpType::Delete => {
                data.remove(&op.key).map_err(|e| RaftError::Fatal {
                    reason: format!("tx delete '{}' failed: {e}", op.key),
                })?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Small shim so the apply helpers work against a redb write table without
/// naming its concrete lifetime-heavy type in every signature.
pub(crate) trait WritableData {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, redb::Error>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), redb::Error>;
    fn remove(&mut self, key: &str) -> Result<(), redb::Error>;
    fn page(&self, prefix: &str, after: &str, limit: i64) -> Result<Vec<String>, RaftError>;
}

impl WritableData for redb::Table<'_, &'static str, &'static [u8]> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, redb::Error> {
        Ok(ReadableTable::get(self, key)?.map(|v| v.value().to_vec()))
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), redb::Error> {
        self.insert(key, value)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), redb::Error> {
        redb::Table::remove(self, key)?;
        Ok(())
    }

    fn page(&self, prefix: &str, after: &str, limit: i64) -> Result<Vec<String>, RaftError> {
        list_page_in(self, prefix, after, limit)
    }
}

/// Shared paged-folder-listing walk over any readable table.
fn list_page_in<T>(table: &T, prefix: &str, after: &str, limit: i64) -> Result<Vec<String>, RaftError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    if limit == 0 {
        return Ok(Vec::new());
    }

    let seek = if after.is_empty() {
        prefix.to_owned()
    } else {
        format!("{prefix}{after}")
    };

    let mut keys: Vec<String> = Vec::new();
    for item in table.range(seek.as_str()..).map_err(RaftError::store)? {
        let (k, _) = item.map_err(RaftError::store)?;
        let full = k.value();
        if !full.starts_with(prefix) {
            break;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if limit > 0 && keys.len() >= limit as usize {
            break;
        }

        let key = &full[prefix.len()..];
        if let Some(i) = key.find('/') {
            // Collapse to the first-segment folder, suppressing consecutive
            // duplicates. The after-comparison happens on the folder name,
            // which is what the previous page would have returned.
            let folder = &key[..=i];
            if keys.last().map(String::as_str) != Some(folder) {
                if !after.is_empty() && folder <= after {
                    continue;
                }
                keys.push(folder.to_owned());
            }
        } else {
            if !after.is_empty() && key <= after {
                continue;
            }
            keys.push(key.to_owned());
        }
    }

    Ok(keys)
}

/// Build an index of the `data` table for test comparison.
#[cfg(test)]
pub(crate) fn dump_data(fsm: &Fsm) -> std::collections::HashMap<String, Vec<u8>> {
    let mut out = std::collections::HashMap::new();
    for key in fsm.list_prefix("").unwrap() {
        let value = fsm.get(&key).unwrap().unwrap();
        out.insert(key, value);
    }
    out
}
