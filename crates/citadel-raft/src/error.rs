//! Error types for `citadel-raft`.

/// Errors from the replicated state machine and its apply pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// A transaction's verify set did not hold at commit time. The
    /// transaction's writes were discarded; the caller may retry.
    #[error("transaction commit failure: {reason}")]
    TransactionCommitFailure { reason: String },

    /// A log entry could not be decoded or is structurally invalid.
    #[error("malformed log entry: {reason}")]
    MalformedEntry { reason: String },

    /// The underlying store failed.
    #[error("fsm store error: {reason}")]
    Store { reason: String },

    /// Snapshot capture or install failed.
    #[error("snapshot error: {reason}")]
    Snapshot { reason: String },

    /// A non-transactional apply failed. Raft requires deterministic
    /// application, so the node must stop serving after this error.
    #[error("fatal apply divergence: {reason}")]
    Fatal { reason: String },
}

impl RaftError {
    pub(crate) fn store(e: impl std::fmt::Display) -> Self {
        Self::Store {
            reason: e.to_string(),
        }
    }

    /// Whether this error means the node is corrupt and must not continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
