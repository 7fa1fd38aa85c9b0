//! Rekey ceremonies.
//!
//! A rekey computes a new set of key shares. In split-only mode the root
//! key is untouched — only the seal key protecting it changes. In
//! rotate-root mode a new root key is generated and the keyring header is
//! re-encrypted under it.
//!
//! Only one rekey may be in progress at a time, identified by a
//! server-generated nonce; it must be completed or explicitly cancelled,
//! and cancellation resets progress even if the nonce has been exposed.
//! Authorization is quorum-based: a threshold of the *current* shares must
//! be submitted before anything changes. The same machine drives recovery
//! key rekeys under an auto-unseal configuration.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::barrier::Barrier;
use crate::crypto::EncryptionKey;
use crate::error::SealError;
use crate::seal::{
    combine_shares, split_key, Seal, SealConfig, SealType, ShamirSeal, RECOVERY_CONFIG_PATH,
    RECOVERY_KEY_PATH, ROOT_KEY_PATH, SEAL_CONFIG_PATH,
};

/// What a completed rekey does to the root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyMode {
    /// New shares only; the root key is unchanged.
    SplitOnly,
    /// Rotate the root key and re-encrypt the keyring header.
    RotateRoot,
}

/// Which key set is being rekeyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyTarget {
    /// The barrier's unseal key shares.
    Barrier,
    /// The recovery key shares (auto-unseal configurations).
    Recovery,
}

/// Parameters for a rekey operation.
#[derive(Debug, Clone)]
pub struct RekeyConfig {
    pub secret_shares: u8,
    pub secret_threshold: u8,
    pub mode: RekeyMode,
    pub target: RekeyTarget,
}

/// Progress of the in-flight rekey, shaped for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RekeyStatus {
    pub nonce: String,
    pub started: bool,
    /// New share count being established.
    pub n: u8,
    /// New threshold being established.
    pub t: u8,
    /// Current-share submissions so far.
    pub progress: u8,
    /// Threshold of current shares required to authorize.
    pub required: u8,
}

/// Outcome of a share submission.
#[derive(Debug)]
pub enum RekeyOutcome {
    /// More current shares are needed.
    InProgress(RekeyStatus),
    /// Quorum reached; the operation completed.
    Complete {
        /// The newly split shares, shown once.
        new_shares: Vec<Vec<u8>>,
    },
}

struct RekeyState {
    nonce: String,
    config: RekeyConfig,
    collected: Vec<Vec<u8>>,
}

/// Drives rekey operations against the barrier and the Shamir seal.
pub struct RekeyManager {
    barrier: Arc<Barrier>,
    shamir: Arc<ShamirSeal>,
    active: Mutex<Option<RekeyState>>,
}

impl std::fmt::Debug for RekeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RekeyManager").finish_non_exhaustive()
    }
}

impl RekeyManager {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, shamir: Arc<ShamirSeal>) -> Self {
        Self {
            barrier,
            shamir,
            active: Mutex::new(None),
        }
    }

    /// Begin a rekey. Fails if one is already in progress or a seal
    /// migration is active.
    ///
    /// # Errors
    ///
    /// - [`SealError::RekeyInProgress`] when another rekey is active.
    /// - [`SealError::MigrationInProgress`] during a seal migration.
    /// - [`SealError::InvalidConfig`] for bad share parameters.
    pub async fn init(
        &self,
        config: RekeyConfig,
        migration_active: bool,
    ) -> Result<RekeyStatus, SealError> {
        if migration_active {
            return Err(SealError::MigrationInProgress);
        }

        let probe = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: config.secret_shares,
            secret_threshold: config.secret_threshold,
            pgp_keys: Vec::new(),
            stored_shares: 0,
            nonce: String::new(),
        };
        probe.validate()?;

        let mut active = self.active.lock().await;
        if let Some(state) = active.as_ref() {
            return Err(SealError::RekeyInProgress {
                nonce: state.nonce.clone(),
            });
        }

        let nonce = uuid::Uuid::new_v4().to_string();
        let current = self.load_current_config(config.target).await?;
        let status = RekeyStatus {
            nonce: nonce.clone(),
            started: true,
            n: config.secret_shares,
            t: config.secret_threshold,
            progress: 0,
            required: current.secret_threshold,
        };

        info!(nonce = %nonce, target = ?config.target, mode = ?config.mode, "rekey initialized");
        *active = Some(RekeyState {
            nonce,
            config,
            collected: Vec::new(),
        });

        Ok(status)
    }

    /// Cancel the in-flight rekey, clearing all progress.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::NoRekeyInProgress`] when there is nothing to
    /// cancel.
    pub async fn cancel(&self) -> Result<(), SealError> {
        let mut active = self.active.lock().await;
        if active.take().is_none() {
            return Err(SealError::NoRekeyInProgress);
        }
        info!("rekey cancelled");
        Ok(())
    }

    /// Status of the in-flight rekey, if any.
    pub async fn status(&self) -> Option<RekeyStatus> {
        let active = self.active.lock().await;
        let state = active.as_ref()?;
        let required = self
            .load_current_config(state.config.target)
            .await
            .map_or(0, |c| c.secret_threshold);
        Some(RekeyStatus {
            nonce: state.nonce.clone(),
            started: true,
            n: state.config.secret_shares,
            t: state.config.secret_threshold,
            progress: u8::try_from(state.collected.len()).unwrap_or(u8::MAX),
            required,
        })
    }

    /// Submit one current share toward the rekey quorum.
    ///
    /// Duplicate submissions of the same share are idempotent. When the
    /// quorum is reached, the shares are verified against the stored key
    /// material; on success the new split is performed and returned, on
    /// failure all progress resets.
    ///
    /// # Errors
    ///
    /// - [`SealError::NoRekeyInProgress`] with no active operation.
    /// - [`SealError::RekeyNonceMismatch`] for a stale nonce.
    /// - [`SealError::InvalidShares`] when the quorum fails verification.
    pub async fn submit(&self, nonce: &str, share: Vec<u8>) -> Result<RekeyOutcome, SealError> {
        let mut active = self.active.lock().await;
        let state = active.as_mut().ok_or(SealError::NoRekeyInProgress)?;
        if state.nonce != nonce {
            return Err(SealError::RekeyNonceMismatch);
        }

        if !state.collected.contains(&share) {
            state.collected.push(share);
        }

        let current = self.load_current_config(state.config.target).await?;
        let submitted = u8::try_from(state.collected.len()).unwrap_or(u8::MAX);
        if submitted < current.secret_threshold {
            return Ok(RekeyOutcome::InProgress(RekeyStatus {
                nonce: state.nonce.clone(),
                started: true,
                n: state.config.secret_shares,
                t: state.config.secret_threshold,
                progress: submitted,
                required: current.secret_threshold,
            }));
        }

        // Quorum reached: take the state so any failure resets progress.
        let state = active.take().unwrap_or_else(|| unreachable!());
        drop(active);

        let result = match state.config.target {
            RekeyTarget::Barrier => {
                self.complete_barrier_rekey(&state, &current).await
            }
            RekeyTarget::Recovery => self.complete_recovery_rekey(&state, &current).await,
        }?;

        Ok(RekeyOutcome::Complete { new_shares: result })
    }

    async fn load_current_config(&self, target: RekeyTarget) -> Result<SealConfig, SealError> {
        let path = match target {
            RekeyTarget::Barrier => SEAL_CONFIG_PATH,
            RekeyTarget::Recovery => RECOVERY_CONFIG_PATH,
        };
        let raw = self
            .barrier
            .get_raw(path)
            .await?
            .ok_or(SealError::NotInitialized)?;
        serde_json::from_slice(&raw).map_err(|e| SealError::InvalidConfig {
            reason: format!("stored seal config undecodable: {e}"),
        })
    }

    async fn store_config(&self, target: RekeyTarget, config: &SealConfig) -> Result<(), SealError> {
        let path = match target {
            RekeyTarget::Barrier => SEAL_CONFIG_PATH,
            RekeyTarget::Recovery => RECOVERY_CONFIG_PATH,
        };
        let raw = serde_json::to_vec(config).map_err(|e| SealError::InvalidConfig {
            reason: format!("seal config encoding failed: {e}"),
        })?;
        self.barrier.put_raw(path, &raw).await?;
        Ok(())
    }

    async fn complete_barrier_rekey(
        &self,
        state: &RekeyState,
        current: &SealConfig,
    ) -> Result<Vec<Vec<u8>>, SealError> {
        // Verify the quorum by reconstructing the current seal key and
        // unwrapping the stored root key with it.
        let seal_key_bytes = combine_shares(&state.collected, current.secret_threshold)?;
        let seal_key_arr: [u8; 32] = seal_key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::InvalidShares)?;

        let verifier = ShamirSeal::new();
        verifier.set_key(EncryptionKey::from_bytes(seal_key_arr)).await;

        let wrapped_root = self
            .barrier
            .get_raw(ROOT_KEY_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let root_bytes = verifier.unwrap(&wrapped_root).await?;
        let root_arr: [u8; 32] = root_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::InvalidShares)?;

        // Decide the root key going forward.
        let root_key = match state.config.mode {
            RekeyMode::SplitOnly => EncryptionKey::from_bytes(root_arr),
            RekeyMode::RotateRoot => {
                let new_root = EncryptionKey::generate();
                self.barrier.rewrap_keyring(new_root.clone()).await?;
                new_root
            }
        };

        // New seal key, new shares, re-wrapped root key record.
        let new_seal_key = EncryptionKey::generate();
        let new_shares = split_key(
            new_seal_key.as_bytes(),
            state.config.secret_shares,
            state.config.secret_threshold,
        )?;

        self.shamir.set_key(new_seal_key).await;
        let wrapped = self.shamir.wrap(root_key.as_bytes()).await?;
        self.barrier.put_raw(ROOT_KEY_PATH, &wrapped).await?;

        self.store_config(
            RekeyTarget::Barrier,
            &SealConfig {
                seal_type: current.seal_type,
                secret_shares: state.config.secret_shares,
                secret_threshold: state.config.secret_threshold,
                pgp_keys: Vec::new(),
                stored_shares: current.stored_shares,
                nonce: String::new(),
            },
        )
        .await?;

        info!(
            shares = state.config.secret_shares,
            threshold = state.config.secret_threshold,
            rotate_root = matches!(state.config.mode, RekeyMode::RotateRoot),
            "barrier rekey complete"
        );
        Ok(new_shares)
    }

    async fn complete_recovery_rekey(
        &self,
        state: &RekeyState,
        current: &SealConfig,
    ) -> Result<Vec<Vec<u8>>, SealError> {
        // Verify the quorum against the stored recovery key.
        let recovery_bytes = combine_shares(&state.collected, current.secret_threshold)?;
        let stored = self
            .barrier
            .get(RECOVERY_KEY_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let matches: bool = {
            use subtle::ConstantTimeEq;
            recovery_bytes.ct_eq(&stored).into()
        };
        if !matches {
            return Err(SealError::InvalidShares);
        }

        let new_recovery = EncryptionKey::generate();
        let new_shares = split_key(
            new_recovery.as_bytes(),
            state.config.secret_shares,
            state.config.secret_threshold,
        )?;
        self.barrier
            .put(RECOVERY_KEY_PATH, new_recovery.as_bytes())
            .await?;

        self.store_config(
            RekeyTarget::Recovery,
            &SealConfig {
                seal_type: current.seal_type,
                secret_shares: state.config.secret_shares,
                secret_threshold: state.config.secret_threshold,
                pgp_keys: Vec::new(),
                stored_shares: 0,
                nonce: String::new(),
            },
        )
        .await?;

        info!(
            shares = state.config.secret_shares,
            threshold = state.config.secret_threshold,
            "recovery key rekey complete"
        );
        Ok(new_shares)
    }
}
