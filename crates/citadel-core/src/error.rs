//! Error types for `citadel-core`.
//!
//! Each subsystem has its own error enum with enough context to diagnose a
//! failure without a debugger. Crypto errors never include key material —
//! only key terms or operation descriptions. The server crate maps these
//! into HTTP statuses; the only variants that terminate the process are the
//! integrity-fatal ones ([`BarrierError::CiphertextCorrupt`] on core paths,
//! [`BarrierError::NonceReuse`], and fatal apply divergence from the log).

use citadel_storage::StorageError;

/// Errors from cryptographic primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// The envelope header is malformed or names an unknown algorithm.
    #[error("invalid ciphertext envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed — no operations until unseal.
    #[error("barrier is sealed")]
    Sealed,

    /// The barrier has already been initialized.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// The barrier has not been initialized.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// An AEAD tag failed to verify. The entry is corrupt or was encrypted
    /// under a different keyring; on core paths this is integrity-fatal.
    #[error("ciphertext corrupt for key '{key}'")]
    CiphertextCorrupt { key: String },

    /// The envelope names a keyring term this barrier does not hold.
    #[error("ciphertext for key '{key}' uses unknown keyring term {term}")]
    UnknownTerm { key: String, term: u32 },

    /// The nonce source produced a duplicate. Fatal: continuing would
    /// destroy AES-GCM's confidentiality guarantees.
    #[error("nonce reuse detected — refusing to continue")]
    NonceReuse,

    /// A cryptographic operation failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend failed.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record failed to (de)serialize.
    #[error("barrier serialization error: {reason}")]
    Serialization { reason: String },
}

/// Errors from the seal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The core has already been initialized.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The core has not been initialized.
    #[error("not initialized")]
    NotInitialized,

    /// The barrier is already unsealed.
    #[error("already unsealed")]
    AlreadyUnsealed,

    /// Invalid Shamir or seal configuration parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted key share was malformed.
    #[error("invalid key share: {reason}")]
    InvalidShare { reason: String },

    /// The collected shares did not reconstruct a key that unwraps the
    /// root key. Progress has been reset.
    #[error("key shares did not reconstruct a valid key")]
    InvalidShares,

    /// The external key wrapper failed. Carries a transient marker so
    /// clients may retry.
    #[error("key wrapper '{wrapper}' failed: {reason}")]
    WrapperFailure { wrapper: String, reason: String },

    /// A rekey operation is already in progress.
    #[error("rekey already in progress (nonce {nonce})")]
    RekeyInProgress { nonce: String },

    /// No rekey operation is in progress.
    #[error("no rekey in progress")]
    NoRekeyInProgress,

    /// The supplied rekey nonce does not match the active operation.
    #[error("rekey nonce mismatch")]
    RekeyNonceMismatch,

    /// A seal migration is active; privileged key ceremonies are blocked.
    #[error("seal migration in progress")]
    MigrationInProgress,

    /// A cryptographic operation failed during seal handling.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier failed during raw storage access.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// The underlying storage backend failed.
    #[error("seal storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from mount table operations.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The path collides with an existing mount.
    #[error("path already in use: {path}")]
    AlreadyMounted { path: String },

    /// The path collides with a protected system prefix.
    #[error("cannot mount under reserved prefix: {path}")]
    ProtectedPath { path: String },

    /// No mount at the given path.
    #[error("no mount at path: {path}")]
    NotFound { path: String },

    /// Invalid mount path.
    #[error("invalid mount path: {reason}")]
    InvalidPath { reason: String },

    /// No registered engine of this type.
    #[error("unknown engine type: {engine_type}")]
    UnknownEngineType { engine_type: String },

    /// Check-and-set version mismatch on a tune.
    #[error("mount entry version mismatch for '{path}': expected {expected}, found {found}")]
    CasMismatch {
        path: String,
        expected: u64,
        found: u64,
    },

    /// The barrier failed.
    #[error("mount barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// A persisted mount record failed to (de)serialize.
    #[error("mount serialization error: {reason}")]
    Serialization { reason: String },
}

/// Errors from policy storage and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy does not exist.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// Built-in policies cannot be modified or removed.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// Check-and-set version mismatch.
    #[error("policy version mismatch for '{name}': expected {expected}, found {found}")]
    CasMismatch {
        name: String,
        expected: u64,
        found: u64,
    },

    /// The barrier failed.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the token store.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No such token.
    #[error("token not found")]
    NotFound,

    /// The token exists but has passed its expiry.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The token cannot be renewed (batch token, or renewable = false).
    #[error("token is not renewable")]
    NotRenewable,

    /// Renewal would exceed the explicit max TTL.
    #[error("token has reached its explicit max TTL")]
    MaxTtlExceeded,

    /// The token string is malformed.
    #[error("malformed token")]
    Malformed,

    /// The barrier failed.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the expiration manager.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// No such lease.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease is not renewable.
    #[error("lease is not renewable: {lease_id}")]
    NotRenewable { lease_id: String },

    /// Revocation exhausted its retries; the lease is parked as
    /// irrevocable and retried by the periodic sweep.
    #[error("lease is irrevocable: {lease_id}")]
    Irrevocable { lease_id: String },

    /// The barrier failed.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the identity store.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No such entity.
    #[error("entity not found: {id}")]
    NotFound { id: String },

    /// The barrier failed.
    #[error("identity barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Every sink failed to record the entry; the request must fail.
    #[error("all audit sinks failed")]
    AllSinksFailed,

    /// One sink failed.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },
}

/// Logical errors engines return to the router.
///
/// These are the engine/router contract — the transport maps them onto
/// HTTP statuses (403 / 400 / 405 / 404 / 503).
#[derive(Debug, thiserror::Error)]
pub enum LogicalError {
    /// The operation is not permitted.
    #[error("permission denied")]
    PermissionDenied,

    /// The request is malformed for this engine.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The engine does not support this operation on this path.
    #[error("unsupported operation")]
    UnsupportedOperation,

    /// The node cannot accept writes (standby replica).
    #[error("cannot write on a read-only node")]
    ReadOnly,

    /// Nothing at the requested path.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// An upstream dependency failed; marked transient so clients may retry.
    #[error("upstream failure (retryable): {reason}")]
    Upstream { reason: String },

    /// Internal engine failure.
    #[error("internal engine error: {reason}")]
    Internal { reason: String },
}

impl From<BarrierError> for LogicalError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::ReadOnly,
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

/// Top-level errors from the core request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The barrier is sealed.
    #[error("citadel is sealed")]
    Sealed,

    /// This node is a standby; the request belongs on the active node.
    /// Carries the leader's advertised address when known.
    #[error("standby node, no local handling")]
    Standby { leader_addr: Option<String> },

    /// No active node holds the lock.
    #[error("no active node")]
    NoLeader,

    /// Missing or invalid client token.
    #[error("permission denied")]
    Unauthorized,

    /// Policy denied the request.
    #[error("permission denied")]
    PermissionDenied,

    /// The request is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Nothing at the requested path.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// A conflicting operation is in progress or a CAS check failed.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The request exceeded its deadline. Committed writes are not rolled
    /// back.
    #[error("request timed out")]
    Timeout,

    /// Upstream dependency failed; retryable.
    #[error("upstream failure (retryable): {reason}")]
    Upstream { reason: String },

    /// Integrity-fatal condition. The node must stop serving.
    #[error("integrity failure: {reason}")]
    Fatal { reason: String },

    /// Internal failure.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CoreError {
    pub(crate) fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal {
            reason: e.to_string(),
        }
    }
}

impl From<LogicalError> for CoreError {
    fn from(err: LogicalError) -> Self {
        match err {
            LogicalError::PermissionDenied => Self::PermissionDenied,
            LogicalError::InvalidRequest { reason } => Self::InvalidRequest { reason },
            LogicalError::UnsupportedOperation => Self::InvalidRequest {
                reason: "unsupported operation".to_owned(),
            },
            LogicalError::ReadOnly => Self::Standby { leader_addr: None },
            LogicalError::NotFound { path } => Self::NotFound { path },
            LogicalError::Upstream { reason } => Self::Upstream { reason },
            LogicalError::Internal { reason } => Self::Internal { reason },
        }
    }
}

impl From<BarrierError> for CoreError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed,
            BarrierError::NonceReuse => Self::Fatal {
                reason: err.to_string(),
            },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<TokenError> for CoreError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound | TokenError::Expired { .. } | TokenError::Malformed => {
                Self::Unauthorized
            }
            TokenError::NotRenewable | TokenError::MaxTtlExceeded => Self::InvalidRequest {
                reason: err.to_string(),
            },
            TokenError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<PolicyError> for CoreError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound { .. } => Self::NotFound {
                path: err.to_string(),
            },
            PolicyError::Invalid { .. } => Self::InvalidRequest {
                reason: err.to_string(),
            },
            PolicyError::BuiltIn { .. } => Self::PermissionDenied,
            PolicyError::CasMismatch { .. } => Self::Conflict {
                reason: err.to_string(),
            },
            PolicyError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<MountError> for CoreError {
    fn from(err: MountError) -> Self {
        match err {
            MountError::AlreadyMounted { .. } | MountError::CasMismatch { .. } => Self::Conflict {
                reason: err.to_string(),
            },
            MountError::NotFound { path } => Self::NotFound { path },
            MountError::ProtectedPath { .. }
            | MountError::InvalidPath { .. }
            | MountError::UnknownEngineType { .. } => Self::InvalidRequest {
                reason: err.to_string(),
            },
            MountError::Barrier(inner) => inner.into(),
            MountError::Serialization { reason } => Self::Internal { reason },
        }
    }
}

impl From<LeaseError> for CoreError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound { .. } => Self::InvalidRequest {
                reason: err.to_string(),
            },
            LeaseError::NotRenewable { .. } | LeaseError::Irrevocable { .. } => {
                Self::InvalidRequest {
                    reason: err.to_string(),
                }
            }
            LeaseError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<SealError> for CoreError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::AlreadyInitialized
            | SealError::AlreadyUnsealed
            | SealError::RekeyInProgress { .. }
            | SealError::MigrationInProgress => Self::Conflict {
                reason: err.to_string(),
            },
            SealError::WrapperFailure { .. } => Self::Upstream {
                reason: err.to_string(),
            },
            SealError::NotInitialized
            | SealError::InvalidConfig { .. }
            | SealError::InvalidShare { .. }
            | SealError::InvalidShares
            | SealError::NoRekeyInProgress
            | SealError::RekeyNonceMismatch => Self::InvalidRequest {
                reason: err.to_string(),
            },
            SealError::Crypto(e) => Self::Internal {
                reason: e.to_string(),
            },
            SealError::Barrier(inner) => inner.into(),
            SealError::Storage(e) => Self::Internal {
                reason: e.to_string(),
            },
        }
    }
}
