//! Replicated storage for Citadel.
//!
//! This crate is the deterministic half of the replication story: a state
//! machine ([`Fsm`]) that turns committed log entries into idempotent writes
//! against an embedded redb store, with transactional verify/apply
//! semantics, paged folder listing, chunked-command assembly, and
//! metadata-only snapshots whose install swaps the database file atomically.
//!
//! [`RaftStore`] wraps the state machine as a [`citadel_storage::StorageBackend`]
//! so the encryption barrier persists through the log: every write gets a
//! commit index, and two replicas fed the same entries arrive at
//! byte-identical stores.

mod chunk;
mod error;
mod fsm;
mod log;
mod snapshot;
mod store;

pub use chunk::{split_command, ChunkedOp, CHUNK_PREFIX};
pub use error::RaftError;
pub use fsm::{ApplyResponse, Fsm, RestoreCallback};
pub use log::{
    ConfigurationValue, IndexValue, LocalNodeConfig, LogBody, LogData, LogEntry, OpType,
    Operation, Server, Suffrage, VerifyListExpectation,
};
pub use snapshot::SnapshotMeta;
pub use store::RaftStore;
