//! Log entry model for the replicated store.
//!
//! A committed log entry carries a [`LogData`] — an ordered list of
//! operations applied atomically by the state machine. Entries whose first
//! operation is [`OpType::BeginTx`] form a transaction: verify operations are
//! checked against pre-transaction state before any of the transaction's
//! writes happen, giving optimistic-concurrency semantics with conflict
//! detection at commit.

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Operation kinds carried in a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// Write a key.
    Put,
    /// Delete a key.
    Delete,
    /// Open a transaction. Must be the first operation.
    BeginTx,
    /// Close a transaction. Must be the last operation.
    CommitTx,
    /// Assert a key's current value (or absence) before the transaction's
    /// writes are applied.
    VerifyRead,
    /// Assert the current page of keys under a prefix.
    VerifyList,
    /// Invoke the post-restore callback. Emitted once after a snapshot
    /// install so upper layers can invalidate caches.
    RestoreCallback,
}

/// A single operation within a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_type: OpType,
    /// Target key; for `VerifyList` this is the prefix.
    #[serde(default)]
    pub key: String,
    /// Value for `Put`; expected value for `VerifyRead` (`None` asserts the
    /// key is absent); encoded [`VerifyListExpectation`] for `VerifyList`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

impl Operation {
    /// A `put` operation.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            op_type: OpType::Put,
            key: key.into(),
            value: Some(value),
        }
    }

    /// A `delete` operation.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op_type: OpType::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// A `verify_read` operation. `expected = None` asserts absence.
    #[must_use]
    pub fn verify_read(key: impl Into<String>, expected: Option<Vec<u8>>) -> Self {
        Self {
            op_type: OpType::VerifyRead,
            key: key.into(),
            value: expected,
        }
    }

    /// A `verify_list` operation over `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::MalformedEntry`] if the expectation cannot be
    /// encoded.
    pub fn verify_list(
        prefix: impl Into<String>,
        expectation: &VerifyListExpectation,
    ) -> Result<Self, RaftError> {
        let value = serde_json::to_vec(expectation).map_err(|e| RaftError::MalformedEntry {
            reason: format!("verify_list expectation encoding failed: {e}"),
        })?;
        Ok(Self {
            op_type: OpType::VerifyList,
            key: prefix.into(),
            value: Some(value),
        })
    }

    /// Marker operations opening and closing a transaction.
    #[must_use]
    pub fn begin_tx() -> Self {
        Self {
            op_type: OpType::BeginTx,
            key: String::new(),
            value: None,
        }
    }

    /// See [`Operation::begin_tx`].
    #[must_use]
    pub fn commit_tx() -> Self {
        Self {
            op_type: OpType::CommitTx,
            key: String::new(),
            value: None,
        }
    }
}

/// The expected result of a paged listing, checked by `verify_list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyListExpectation {
    /// Pagination cursor the expectation was captured with.
    #[serde(default)]
    pub after: String,
    /// Page size the expectation was captured with (`-1` = unbounded).
    #[serde(default)]
    pub limit: i64,
    /// The keys the caller observed.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// The payload of a command log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogData {
    pub operations: Vec<Operation>,
}

impl LogData {
    /// Wrap a list of operations.
    #[must_use]
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Whether this entry is a transaction (first op is `begin_tx`).
    #[must_use]
    pub fn is_transaction(&self) -> bool {
        self.operations
            .first()
            .is_some_and(|op| op.op_type == OpType::BeginTx)
    }

    /// Check transactional well-formedness: `begin_tx` first, `commit_tx`
    /// last, and neither appearing anywhere else. Non-transactional entries
    /// must contain no transaction markers at all.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::TransactionCommitFailure`] for a malformed
    /// transaction, mirroring how a mixed-marker entry is rejected without
    /// failing the surrounding batch.
    pub fn validate_shape(&self) -> Result<(), RaftError> {
        let n = self.operations.len();
        for (i, op) in self.operations.iter().enumerate() {
            match op.op_type {
                OpType::BeginTx | OpType::CommitTx => {
                    let well_placed = self.is_transaction()
                        && self
                            .operations
                            .last()
                            .is_some_and(|op| op.op_type == OpType::CommitTx)
                        && (i == 0 || i == n - 1);
                    if !well_placed {
                        return Err(RaftError::TransactionCommitFailure {
                            reason: "begin_tx/commit_tx mixed inside other operations".to_owned(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Encode for the wire / the log.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::MalformedEntry`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        serde_json::to_vec(self).map_err(|e| RaftError::MalformedEntry {
            reason: format!("log data encoding failed: {e}"),
        })
    }

    /// Decode from the wire / the log.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::MalformedEntry`] if decoding fails.
    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::MalformedEntry {
            reason: format!("log data decoding failed: {e}"),
        })
    }
}

/// A node's intended suffrage, preserved across snapshot installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suffrage {
    Voter,
    NonVoter,
}

/// The node-local configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    pub node_id: String,
    pub suffrage: Suffrage,
}

/// One peer in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub node_id: String,
    pub address: String,
    pub suffrage: Suffrage,
}

/// The latest cluster configuration the state machine has observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValue {
    /// Log index the configuration was committed at.
    pub index: u64,
    pub servers: Vec<Server>,
}

/// The latest applied position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexValue {
    pub term: u64,
    pub index: u64,
}

/// A committed log entry handed to the state machine.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub body: LogBody,
}

/// The two entry kinds the state machine understands.
#[derive(Debug, Clone)]
pub enum LogBody {
    /// A command batch of operations.
    Command(LogData),
    /// A cluster-membership change.
    Configuration(ConfigurationValue),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let data = LogData::new(vec![
            Operation::put("a/b", b"v".to_vec()),
            Operation::delete("a/c"),
        ]);
        let bytes = data.encode().unwrap();
        assert_eq!(LogData::decode(&bytes).unwrap(), data);
    }

    #[test]
    fn transaction_shape_accepted() {
        let data = LogData::new(vec![
            Operation::begin_tx(),
            Operation::verify_read("a", Some(b"1".to_vec())),
            Operation::put("a", b"2".to_vec()),
            Operation::commit_tx(),
        ]);
        assert!(data.is_transaction());
        data.validate_shape().unwrap();
    }

    #[test]
    fn nested_markers_rejected() {
        let data = LogData::new(vec![
            Operation::begin_tx(),
            Operation::begin_tx(),
            Operation::commit_tx(),
        ]);
        let err = data.validate_shape().unwrap_err();
        assert!(matches!(err, RaftError::TransactionCommitFailure { .. }));
    }

    #[test]
    fn missing_commit_rejected() {
        let data = LogData::new(vec![
            Operation::begin_tx(),
            Operation::put("a", b"1".to_vec()),
        ]);
        let err = data.validate_shape().unwrap_err();
        assert!(matches!(err, RaftError::TransactionCommitFailure { .. }));
    }

    #[test]
    fn markers_inside_plain_entry_rejected() {
        let data = LogData::new(vec![
            Operation::put("a", b"1".to_vec()),
            Operation::commit_tx(),
        ]);
        let err = data.validate_shape().unwrap_err();
        assert!(matches!(err, RaftError::TransactionCommitFailure { .. }));
    }

    #[test]
    fn plain_entry_accepted() {
        let data = LogData::new(vec![Operation::put("a", b"1".to_vec())]);
        assert!(!data.is_transaction());
        data.validate_shape().unwrap();
    }
}
