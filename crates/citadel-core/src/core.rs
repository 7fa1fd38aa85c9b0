//! The core: seal lifecycle, HA leadership, and the request pipeline.
//!
//! A single [`Core`] is created at process startup, owns every subsystem
//! exclusively, and is the only shared root. The state lock guards the
//! active-node configuration: request handling takes it shared; seal,
//! unseal, and step-down take it exclusive.
//!
//! Request flow: state check → forwarding decision → token validation →
//! policy evaluation → router dispatch (or the built-in token backend) →
//! lease registration → audit → response envelope. Requests carry a
//! deadline; a request abandoned at its deadline does not roll back writes
//! the log already committed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use citadel_storage::StorageBackend;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::audit::{AuditBroker, AuditEntry};
use crate::barrier::{Barrier, BarrierView};
use crate::crypto::EncryptionKey;
use crate::cubbyhole::CubbyholeEngine;
use crate::engine::{
    AuthSpec, Engine, EngineRegistry, EngineRequest, EngineResponse, Operation, PageArgs,
};
use crate::error::{CoreError, LogicalError, SealError, TokenError};
use crate::expiration::{ExpirationManager, LeaseEntry, LeaseRevoker, RegisterLease};
use crate::ha::HaLock;
use crate::identity::{Entity, IdentityStore};
use crate::kv::KvEngine;
use crate::mount::{MountConfig, MountEntry, MountTable, MountTableType};
use crate::policy::{AclRequest, PolicyStore};
use crate::rekey::RekeyManager;
use crate::router::Router;
use crate::seal::{
    combine_shares, split_key, ExternalSeal, KeyWrapper, Seal, SealConfig, SealType, ShamirSeal,
    StaticSeal, RECOVERY_CONFIG_PATH, RECOVERY_KEY_PATH, ROOT_KEY_PATH, SEAL_CONFIG_PATH,
};
use crate::token::{cidr_match, CreateTokenParams, TokenEntry, TokenStore, TokenType};

/// Display name marking single-use response-wrapping tokens.
const WRAPPING_TOKEN_NAME: &str = "wrapping-token";

/// Cubbyhole path where a wrapped response is parked.
const WRAPPED_RESPONSE_PATH: &str = "response";

/// Core lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Uninitialized,
    Sealed,
    Standby,
    Active,
    /// Recovery mode: barrier open for operator repair, requests refused.
    Recovery,
}

/// Which seal provider the core runs with.
pub enum SealProvider {
    Shamir,
    External(Arc<dyn KeyWrapper>),
    Static(EncryptionKey),
}

/// Static configuration for a core instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub node_id: String,
    /// Address advertised to clients for redirects.
    pub api_addr: String,
    /// Default TTL for issued tokens and leases, seconds.
    pub default_lease_ttl: i64,
    /// Hard ceiling for issued tokens and leases, seconds.
    pub max_lease_ttl: i64,
    /// Per-request deadline, seconds.
    pub request_timeout_secs: u64,
    /// HA lock heartbeat TTL, seconds.
    pub ha_lock_ttl_secs: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            api_addr: "http://127.0.0.1:8200".to_owned(),
            default_lease_ttl: 32 * 24 * 3600,
            max_lease_ttl: 32 * 24 * 3600,
            request_timeout_secs: 90,
            ha_lock_ttl_secs: 15,
        }
    }
}

/// Parameters for initialization.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub secret_shares: u8,
    pub secret_threshold: u8,
    /// Recovery split, used with auto-unseal providers.
    pub recovery_shares: u8,
    pub recovery_threshold: u8,
}

/// Everything initialization hands back, shown once.
#[derive(Debug)]
pub struct InitResult {
    /// Base64 unseal key shares (Shamir seals only).
    pub key_shares: Vec<String>,
    /// Base64 recovery key shares (auto-unseal only).
    pub recovery_shares: Vec<String>,
    pub root_token: String,
}

/// Seal status, shaped for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SealStatusInfo {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(rename = "type")]
    pub seal_type: String,
    pub n: u8,
    pub t: u8,
    pub progress: u8,
    pub nonce: String,
}

/// Outcome of one unseal-share submission.
#[derive(Debug, Clone, Serialize)]
pub struct UnsealOutcome {
    pub sealed: bool,
    pub progress: u8,
    pub threshold: u8,
}

/// Progress of the generate-root ceremony.
#[derive(Debug)]
pub enum GenerateRootOutcome {
    Progress { progress: u8, required: u8 },
    /// Root token XORed with the ceremony OTP, base64.
    Complete { encoded_token: String },
}

struct GenerateRootState {
    nonce: String,
    otp: Vec<u8>,
    collected: Vec<Vec<u8>>,
}

/// A logical request entering the core.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub operation: Operation,
    /// Full logical path, e.g. `secret/data/app`.
    pub path: String,
    pub namespace: String,
    pub data: Option<serde_json::Value>,
    pub token: Option<String>,
    pub client_addr: Option<String>,
    /// Requested response-wrapping TTL, seconds.
    pub wrap_ttl: Option<i64>,
    /// Requested wrapping format. Only the opaque token format is served;
    /// anything else is rejected up front.
    pub wrap_format: Option<String>,
    /// Bypass soft-mandatory policies.
    pub policy_override: bool,
    pub mfa_methods: Vec<String>,
    pub page: Option<PageArgs>,
}

impl Request {
    /// A bare request; callers fill in what they need.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            path: path.into(),
            namespace: String::new(),
            data: None,
            token: None,
            client_addr: None,
            wrap_ttl: None,
            wrap_format: None,
            policy_override: false,
            mfa_methods: Vec::new(),
            page: None,
        }
    }

    /// Attach a client token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Response-wrapping metadata.
#[derive(Debug, Clone, Serialize)]
pub struct WrapInfo {
    pub token: String,
    pub ttl: i64,
    /// Wrapping format; currently always `token`.
    pub format: String,
    pub creation_time: DateTime<Utc>,
}

/// Authentication block of a response.
#[derive(Debug, Clone, Serialize)]
pub struct AuthInfo {
    pub client_token: String,
    pub accessor: String,
    pub policies: Vec<String>,
    pub lease_duration: i64,
    pub renewable: bool,
    pub entity_id: Option<String>,
    pub token_type: String,
    pub orphan: bool,
}

/// The response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct CoreResponse {
    pub request_id: String,
    pub lease_id: Option<String>,
    pub lease_duration: Option<i64>,
    pub renewable: bool,
    pub data: Option<serde_json::Value>,
    pub warnings: Vec<String>,
    pub wrap_info: Option<WrapInfo>,
    pub auth: Option<AuthInfo>,
}

impl CoreResponse {
    fn empty(request_id: String) -> Self {
        Self {
            request_id,
            lease_id: None,
            lease_duration: None,
            renewable: false,
            data: None,
            warnings: Vec::new(),
            wrap_info: None,
            auth: None,
        }
    }
}

/// The core object.
pub struct Core {
    config: CoreConfig,
    barrier: Arc<Barrier>,
    seal: RwLock<Arc<dyn Seal>>,
    shamir: Arc<ShamirSeal>,
    state: RwLock<CoreState>,
    unseal_progress: Mutex<Vec<Vec<u8>>>,
    generate_root: Mutex<Option<GenerateRootState>>,
    migration_active: AtomicBool,
    rekey: RekeyManager,
    mounts: MountTable,
    router: Router,
    registry: EngineRegistry,
    policies: PolicyStore,
    tokens: TokenStore,
    identity: IdentityStore,
    expiration: Arc<ExpirationManager>,
    cubbyhole: Arc<CubbyholeEngine>,
    audit: AuditBroker,
    ha: HaLock,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("node_id", &self.config.node_id)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Build a core over the given physical storage and seal provider.
    ///
    /// The core starts in `Uninitialized` or `Sealed` depending on whether
    /// a seal configuration exists in storage.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the startup probe.
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        provider: SealProvider,
        config: CoreConfig,
    ) -> Result<Arc<Self>, CoreError> {
        let barrier = Arc::new(Barrier::new(Arc::clone(&storage)));
        let shamir = Arc::new(ShamirSeal::new());

        let seal: Arc<dyn Seal> = match provider {
            SealProvider::Shamir => Arc::clone(&shamir) as Arc<dyn Seal>,
            SealProvider::External(wrapper) => {
                barrier.set_seal_wrapper(Some(Arc::clone(&wrapper))).await;
                Arc::new(ExternalSeal::new(wrapper))
            }
            SealProvider::Static(key) => Arc::new(StaticSeal::new(key)),
        };

        let initial_state = if barrier.initialized().await.map_err(CoreError::from)? {
            CoreState::Sealed
        } else {
            CoreState::Uninitialized
        };

        let mut registry = EngineRegistry::new();
        registry.register(
            "kv",
            Arc::new(|view: BarrierView| Arc::new(KvEngine::new(view)) as Arc<dyn Engine>),
        );

        let cubbyhole = Arc::new(CubbyholeEngine::new(BarrierView::new(
            Arc::clone(&barrier),
            "cubbyhole/",
        )));

        let mut hmac_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut hmac_key);

        let core = Arc::new(Self {
            rekey: RekeyManager::new(Arc::clone(&barrier), Arc::clone(&shamir)),
            mounts: MountTable::new(Arc::clone(&barrier)),
            policies: PolicyStore::new(Arc::clone(&barrier)),
            tokens: TokenStore::new(Arc::clone(&barrier)),
            identity: IdentityStore::new(Arc::clone(&barrier)),
            expiration: Arc::new(ExpirationManager::new(Arc::clone(&barrier))),
            ha: HaLock::new(
                Arc::clone(&storage),
                config.node_id.clone(),
                config.api_addr.clone(),
                config.ha_lock_ttl_secs,
            ),
            audit: AuditBroker::new(hmac_key),
            router: Router::new(),
            registry,
            cubbyhole,
            barrier,
            seal: RwLock::new(seal),
            shamir,
            state: RwLock::new(initial_state),
            unseal_progress: Mutex::new(Vec::new()),
            generate_root: Mutex::new(None),
            migration_active: AtomicBool::new(false),
            config,
        });

        let revoker = Arc::new(CoreRevoker {
            core: Arc::downgrade(&core),
        });
        core.expiration
            .set_revoker(revoker as Arc<dyn LeaseRevoker>)
            .await;

        info!(node_id = %core.config.node_id, state = ?initial_state, "core constructed");
        Ok(core)
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// The current lifecycle state.
    pub async fn state(&self) -> CoreState {
        *self.state.read().await
    }

    /// The policy store.
    #[must_use]
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// The token store.
    #[must_use]
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// The identity store.
    #[must_use]
    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    /// The expiration manager.
    #[must_use]
    pub fn expiration(&self) -> &Arc<ExpirationManager> {
        &self.expiration
    }

    /// The audit broker.
    #[must_use]
    pub fn audit(&self) -> &AuditBroker {
        &self.audit
    }

    /// The rekey manager.
    #[must_use]
    pub fn rekey(&self) -> &RekeyManager {
        &self.rekey
    }

    /// Whether a seal migration is currently in flight.
    #[must_use]
    pub fn migration_active(&self) -> bool {
        self.migration_active.load(Ordering::SeqCst)
    }

    /// The node's static configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Seal lifecycle ───────────────────────────────────────────────

    /// Current seal status.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn seal_status(&self) -> Result<SealStatusInfo, CoreError> {
        let seal = Arc::clone(&*self.seal.read().await);
        let state = *self.state.read().await;
        let initialized = !matches!(state, CoreState::Uninitialized);
        let sealed = matches!(state, CoreState::Sealed | CoreState::Uninitialized);

        let (n, t, nonce) = match self.load_seal_config().await {
            Ok(config) => (config.secret_shares, config.secret_threshold, config.nonce),
            Err(_) => (0, 0, String::new()),
        };
        let progress = u8::try_from(self.unseal_progress.lock().await.len()).unwrap_or(u8::MAX);

        Ok(SealStatusInfo {
            initialized,
            sealed,
            seal_type: seal.seal_type().as_str().to_owned(),
            n,
            t,
            progress,
            nonce,
        })
    }

    /// Initialize the core: create the barrier keyring, wrap the root key
    /// under the seal, split shares, and issue the first root token.
    ///
    /// The node comes up unsealed and active so the returned root token is
    /// immediately usable; the operator seals explicitly if cold standby
    /// is wanted.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Conflict`] when already initialized.
    /// - [`CoreError::InvalidRequest`] for bad share parameters.
    pub async fn initialize(&self, params: InitParams) -> Result<InitResult, CoreError> {
        let mut state = self.state.write().await;
        if !matches!(*state, CoreState::Uninitialized) {
            return Err(CoreError::Conflict {
                reason: "already initialized".to_owned(),
            });
        }

        let seal = Arc::clone(&*self.seal.read().await);

        // Validate share parameters before any state is created.
        let barrier_config = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: params.secret_shares,
            secret_threshold: params.secret_threshold,
            pgp_keys: Vec::new(),
            stored_shares: 0,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        let recovery_config = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: params.recovery_shares,
            secret_threshold: params.recovery_threshold,
            pgp_keys: Vec::new(),
            stored_shares: 0,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        if seal.requires_shares() {
            barrier_config.validate().map_err(CoreError::from)?;
        } else {
            recovery_config.validate().map_err(CoreError::from)?;
        }

        let root_key = EncryptionKey::generate();
        self.barrier.initialize(root_key.clone()).await?;

        let (key_shares, recovery_shares) = if seal.requires_shares() {
            let config = barrier_config;
            let seal_key = EncryptionKey::generate();
            let shares = split_key(
                seal_key.as_bytes(),
                params.secret_shares,
                params.secret_threshold,
            )
            .map_err(CoreError::from)?;
            self.shamir.set_key(seal_key).await;

            let wrapped = seal.wrap(root_key.as_bytes()).await.map_err(CoreError::from)?;
            self.barrier.put_raw(ROOT_KEY_PATH, &wrapped).await?;
            self.store_seal_config(SEAL_CONFIG_PATH, &config).await?;

            (shares, Vec::new())
        } else {
            let config = SealConfig {
                seal_type: seal.seal_type(),
                secret_shares: 1,
                secret_threshold: 1,
                pgp_keys: Vec::new(),
                stored_shares: 1,
                nonce: uuid::Uuid::new_v4().to_string(),
            };

            let wrapped = seal.wrap(root_key.as_bytes()).await.map_err(CoreError::from)?;
            self.barrier.put_raw(ROOT_KEY_PATH, &wrapped).await?;
            self.store_seal_config(SEAL_CONFIG_PATH, &config).await?;

            // Recovery key split gates privileged ceremonies.
            let recovery_key = EncryptionKey::generate();
            let shares = split_key(
                recovery_key.as_bytes(),
                params.recovery_shares,
                params.recovery_threshold,
            )
            .map_err(CoreError::from)?;
            self.barrier
                .put(RECOVERY_KEY_PATH, recovery_key.as_bytes())
                .await?;
            self.store_seal_config(RECOVERY_CONFIG_PATH, &recovery_config)
                .await?;

            (Vec::new(), shares)
        };

        let (root_token, _) = self.tokens.create_root().await?;

        self.become_ready(&mut state).await?;
        info!("core initialized");

        Ok(InitResult {
            key_shares: key_shares.iter().map(|s| B64.encode(s)).collect(),
            recovery_shares: recovery_shares.iter().map(|s| B64.encode(s)).collect(),
            root_token,
        })
    }

    /// Submit one unseal key share.
    ///
    /// Duplicate submissions are idempotent. When the threshold is reached
    /// the seal key is reconstructed and the stored root key unwrapped; a
    /// failed reconstruction resets all progress.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Conflict`] when already unsealed.
    /// - [`CoreError::InvalidRequest`] for bad shares or a share-less seal.
    pub async fn submit_unseal_share(&self, share: Vec<u8>) -> Result<UnsealOutcome, CoreError> {
        let mut state = self.state.write().await;
        match *state {
            CoreState::Uninitialized => {
                return Err(CoreError::from(SealError::NotInitialized))
            }
            CoreState::Sealed => {}
            _ => return Err(CoreError::from(SealError::AlreadyUnsealed)),
        }

        let seal = Arc::clone(&*self.seal.read().await);
        if !seal.requires_shares() {
            return Err(CoreError::InvalidRequest {
                reason: "seal does not use operator key shares".to_owned(),
            });
        }
        if share.is_empty() {
            return Err(CoreError::from(SealError::InvalidShare {
                reason: "empty share".to_owned(),
            }));
        }

        let config = self.load_seal_config().await?;
        let threshold = config.secret_threshold;

        let mut progress = self.unseal_progress.lock().await;
        if !progress.contains(&share) {
            progress.push(share);
        }
        let submitted = u8::try_from(progress.len()).unwrap_or(u8::MAX);
        if submitted < threshold {
            return Ok(UnsealOutcome {
                sealed: true,
                progress: submitted,
                threshold,
            });
        }

        // Threshold reached: reconstruct, clearing progress either way.
        let shares = std::mem::take(&mut *progress);
        drop(progress);

        let unwrap_result = async {
            let seal_key_bytes = combine_shares(&shares, threshold)?;
            let seal_key_arr: [u8; 32] = seal_key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SealError::InvalidShares)?;
            self.shamir
                .set_key(EncryptionKey::from_bytes(seal_key_arr))
                .await;

            let wrapped = self
                .barrier
                .get_raw(ROOT_KEY_PATH)
                .await
                .map_err(SealError::from)?
                .ok_or(SealError::NotInitialized)?;
            let root_bytes = self.shamir.unwrap(&wrapped).await?;
            let root_arr: [u8; 32] = root_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SealError::InvalidShares)?;
            Ok::<EncryptionKey, SealError>(EncryptionKey::from_bytes(root_arr))
        }
        .await;

        let root_key = match unwrap_result {
            Ok(key) => key,
            Err(e) => {
                self.shamir.clear_key().await;
                warn!("unseal share set failed verification; progress reset");
                return Err(CoreError::from(e));
            }
        };

        self.barrier.unseal(root_key).await?;
        self.become_ready(&mut state).await?;

        Ok(UnsealOutcome {
            sealed: false,
            progress: 0,
            threshold,
        })
    }

    /// Reset unseal progress, discarding collected shares.
    pub async fn reset_unseal_progress(&self) {
        self.unseal_progress.lock().await.clear();
        info!("unseal progress reset");
    }

    /// Unseal automatically through an external or static seal.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidRequest`] for a Shamir seal.
    /// - [`CoreError::Upstream`] when the wrapper is unreachable.
    pub async fn auto_unseal(&self) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        match *state {
            CoreState::Sealed => {}
            CoreState::Uninitialized => {
                return Err(CoreError::from(SealError::NotInitialized))
            }
            _ => return Ok(()),
        }

        let seal = Arc::clone(&*self.seal.read().await);
        if seal.requires_shares() {
            return Err(CoreError::InvalidRequest {
                reason: "seal requires operator key shares".to_owned(),
            });
        }

        let wrapped = self
            .barrier
            .get_raw(ROOT_KEY_PATH)
            .await?
            .ok_or_else(|| CoreError::from(SealError::NotInitialized))?;
        let root_bytes = seal.unwrap(&wrapped).await.map_err(CoreError::from)?;
        let root_arr: [u8; 32] = root_bytes.as_slice().try_into().map_err(|_| {
            CoreError::Fatal {
                reason: "unwrapped root key has wrong length".to_owned(),
            }
        })?;

        self.barrier
            .unseal(EncryptionKey::from_bytes(root_arr))
            .await?;
        self.become_ready(&mut state).await?;
        Ok(())
    }

    /// Seal the core: tear down engines, drop the keyring, clear all key
    /// ceremony progress. Sealing an already-sealed core is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the teardown.
    pub async fn seal_core(&self) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        match *state {
            CoreState::Sealed | CoreState::Uninitialized => return Ok(()),
            CoreState::Active => {
                self.pre_seal().await;
                self.ha.release().await.map_err(CoreError::internal)?;
            }
            CoreState::Standby | CoreState::Recovery => {}
        }

        self.barrier.seal().await;
        self.shamir.clear_key().await;
        self.unseal_progress.lock().await.clear();
        *self.generate_root.lock().await = None;
        *state = CoreState::Sealed;

        info!("core sealed");
        Ok(())
    }

    /// Voluntarily hand off leadership: tear down the active-node state
    /// (engines, expiration queue ownership) but keep the barrier
    /// unsealed, then rejoin as a standby.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Standby`] when not active.
    pub async fn step_down(&self) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        if !matches!(*state, CoreState::Active) {
            return Err(CoreError::Standby {
                leader_addr: self.leader_addr().await,
            });
        }
        self.pre_seal().await;
        self.ha.release().await.map_err(CoreError::internal)?;
        *state = CoreState::Standby;
        info!("stepped down to standby");
        Ok(())
    }

    /// Periodic HA maintenance: standbys try to take the lock; the active
    /// node heartbeats and demotes itself if the lock was lost.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn ha_tick(&self) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        match *state {
            CoreState::Standby => {
                if self.ha.try_acquire().await.map_err(CoreError::internal)? {
                    self.post_unseal().await?;
                    *state = CoreState::Active;
                    info!("promoted to active");
                }
            }
            CoreState::Active => {
                if !self.ha.renew().await.map_err(CoreError::internal)? {
                    warn!("ha lock lost; demoting to standby");
                    self.pre_seal().await;
                    *state = CoreState::Standby;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The current leader's advertised address, when one exists and it is
    /// not this node.
    pub async fn leader_addr(&self) -> Option<String> {
        match self.ha.leader().await {
            Ok(Some(record)) if record.holder != self.config.node_id => Some(record.api_addr),
            _ => None,
        }
    }

    /// Append a new barrier keyring term.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn rotate_barrier(&self) -> Result<u32, CoreError> {
        Ok(self.barrier.rotate().await?)
    }

    // ── Seal migration ───────────────────────────────────────────────

    /// Migrate to a new seal: verify an authorizing quorum of current
    /// shares, unwrap the root key, re-wrap it under the new seal, and
    /// swap providers. Rekeys are blocked for the duration.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Conflict`] when a migration is already running.
    /// - [`CoreError::PermissionDenied`]-shaped invalid-share errors when
    ///   the quorum fails verification.
    pub async fn migrate_seal(
        &self,
        new_seal: Arc<dyn Seal>,
        authorizing_shares: Vec<Vec<u8>>,
    ) -> Result<(), CoreError> {
        if self
            .migration_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::Conflict {
                reason: "seal migration already in progress".to_owned(),
            });
        }

        let result = self.migrate_seal_inner(new_seal, authorizing_shares).await;
        self.migration_active.store(false, Ordering::SeqCst);
        result
    }

    async fn migrate_seal_inner(
        &self,
        new_seal: Arc<dyn Seal>,
        authorizing_shares: Vec<Vec<u8>>,
    ) -> Result<(), CoreError> {
        if !self.barrier.is_unsealed().await {
            return Err(CoreError::Sealed);
        }

        let root_bytes = self.verify_key_quorum(&authorizing_shares).await?;

        let wrapped = new_seal
            .wrap(&root_bytes)
            .await
            .map_err(CoreError::from)?;
        self.barrier.put_raw(ROOT_KEY_PATH, &wrapped).await?;

        let config = SealConfig {
            seal_type: new_seal.seal_type(),
            secret_shares: 1,
            secret_threshold: 1,
            pgp_keys: Vec::new(),
            stored_shares: 1,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        self.store_seal_config(SEAL_CONFIG_PATH, &config).await?;

        *self.seal.write().await = new_seal;
        info!("seal migration complete");
        Ok(())
    }

    // ── Generate-root ceremony ───────────────────────────────────────

    /// Start a generate-root ceremony. Returns `(nonce, base64 OTP)`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] when one is already in progress.
    pub async fn generate_root_init(&self) -> Result<(String, String), CoreError> {
        let mut slot = self.generate_root.lock().await;
        if slot.is_some() {
            return Err(CoreError::Conflict {
                reason: "generate-root already in progress".to_owned(),
            });
        }

        let nonce = uuid::Uuid::new_v4().to_string();
        // OTP sized to the service-token format: "s." plus 22 b64url chars.
        let mut otp = vec![0u8; 24];
        OsRng.fill_bytes(&mut otp);
        let otp_b64 = B64.encode(&otp);

        *slot = Some(GenerateRootState {
            nonce: nonce.clone(),
            otp,
            collected: Vec::new(),
        });
        info!("generate-root ceremony started");
        Ok((nonce, otp_b64))
    }

    /// Cancel the ceremony, clearing all progress.
    pub async fn generate_root_cancel(&self) {
        *self.generate_root.lock().await = None;
    }

    /// Submit one share toward the generate-root quorum.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidRequest`] with no ceremony or a stale nonce.
    /// - Invalid-share errors when the quorum fails verification
    ///   (progress resets).
    pub async fn generate_root_update(
        &self,
        nonce: &str,
        share: Vec<u8>,
    ) -> Result<GenerateRootOutcome, CoreError> {
        let mut slot = self.generate_root.lock().await;
        let state = slot.as_mut().ok_or_else(|| CoreError::InvalidRequest {
            reason: "no generate-root in progress".to_owned(),
        })?;
        if state.nonce != nonce {
            return Err(CoreError::from(SealError::RekeyNonceMismatch));
        }

        if !state.collected.contains(&share) {
            state.collected.push(share);
        }

        let required = self.privileged_quorum_threshold().await?;
        let submitted = u8::try_from(state.collected.len()).unwrap_or(u8::MAX);
        if submitted < required {
            return Ok(GenerateRootOutcome::Progress {
                progress: submitted,
                required,
            });
        }

        let state = slot.take().unwrap_or_else(|| unreachable!());
        drop(slot);

        // Failure resets the ceremony entirely.
        self.verify_key_quorum(&state.collected).await?;

        let (token, _) = self.tokens.create_root().await?;
        let encoded: Vec<u8> = token
            .as_bytes()
            .iter()
            .zip(state.otp.iter().cycle())
            .map(|(t, o)| t ^ o)
            .collect();

        info!("generate-root ceremony complete");
        Ok(GenerateRootOutcome::Complete {
            encoded_token: B64.encode(encoded),
        })
    }

    /// Threshold for privileged ceremonies: the recovery config when an
    /// auto-unseal wrapper is in play, the seal config otherwise.
    async fn privileged_quorum_threshold(&self) -> Result<u8, CoreError> {
        if let Some(raw) = self.barrier.get_raw(RECOVERY_CONFIG_PATH).await? {
            let config: SealConfig =
                serde_json::from_slice(&raw).map_err(CoreError::internal)?;
            return Ok(config.secret_threshold);
        }
        Ok(self.load_seal_config().await?.secret_threshold)
    }

    /// Verify a quorum of shares against the stored key material. Returns
    /// the root key bytes for Shamir seals, or the recovery key bytes for
    /// auto-unseal setups.
    async fn verify_key_quorum(&self, shares: &[Vec<u8>]) -> Result<Vec<u8>, CoreError> {
        let threshold = self.privileged_quorum_threshold().await?;
        let combined = combine_shares(shares, threshold).map_err(CoreError::from)?;

        if let Some(stored) = self.barrier.get(RECOVERY_KEY_PATH).await.ok().flatten() {
            let matches: bool = combined.ct_eq(&stored).into();
            if !matches {
                return Err(CoreError::from(SealError::InvalidShares));
            }
            return Ok(combined);
        }

        // Shamir: the combined key must unwrap the stored root key.
        let key_arr: [u8; 32] = combined
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::from(SealError::InvalidShares))?;
        let verifier = ShamirSeal::new();
        verifier.set_key(EncryptionKey::from_bytes(key_arr)).await;
        let wrapped = self
            .barrier
            .get_raw(ROOT_KEY_PATH)
            .await?
            .ok_or_else(|| CoreError::from(SealError::NotInitialized))?;
        let root = verifier.unwrap(&wrapped).await.map_err(CoreError::from)?;
        Ok(root)
    }

    // ── Post-unseal / pre-seal ───────────────────────────────────────

    async fn become_ready(
        &self,
        state: &mut CoreState,
    ) -> Result<(), CoreError> {
        if self.ha.try_acquire().await.map_err(CoreError::internal)? {
            self.post_unseal().await?;
            *state = CoreState::Active;
            info!("node is active");
        } else {
            *state = CoreState::Standby;
            info!("node is standby");
        }
        Ok(())
    }

    async fn post_unseal(&self) -> Result<(), CoreError> {
        self.mounts.load().await?;

        // Default secret mount on first activation.
        if self.mounts.find(MountTableType::Secret, "secret/").await.is_none() {
            let mut entry = MountEntry::new("secret/", "kv");
            entry.description = "key/value secret storage".to_owned();
            self.mounts.add(MountTableType::Secret, entry).await?;
        }

        self.router.clear().await;
        for entry in self.mounts.list(MountTableType::Secret).await {
            let view = BarrierView::new(Arc::clone(&self.barrier), entry.storage_prefix())
                .with_seal_wrap(entry.seal_wrap);
            let engine = self.registry.create(&entry.entry_type, view)?;
            engine.initialize().await.map_err(CoreError::from)?;
            self.router.mount(entry, engine).await?;
        }

        // The cubbyhole route is synthetic: fixed storage prefix, one
        // engine instance shared with the revocation path.
        let mut cubby = MountEntry::new("cubbyhole/", "cubbyhole");
        cubby.description = "per-token private storage".to_owned();
        self.router
            .mount(cubby, Arc::clone(&self.cubbyhole) as Arc<dyn Engine>)
            .await?;

        let restored = self.expiration.restore().await?;
        info!(leases_restored = restored, "post-unseal complete");
        Ok(())
    }

    async fn pre_seal(&self) {
        for path in self.router.paths().await {
            if let Some((route, _)) = self.router.resolve(&path).await {
                route.engine.cleanup().await;
            }
        }
        self.router.clear().await;
    }

    async fn load_seal_config(&self) -> Result<SealConfig, SealError> {
        let raw = self
            .barrier
            .get_raw(SEAL_CONFIG_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        serde_json::from_slice(&raw).map_err(|e| SealError::InvalidConfig {
            reason: format!("stored seal config undecodable: {e}"),
        })
    }

    async fn store_seal_config(
        &self,
        path: &str,
        config: &SealConfig,
    ) -> Result<(), CoreError> {
        let raw = serde_json::to_vec(config).map_err(CoreError::internal)?;
        self.barrier.put_raw(path, &raw).await?;
        Ok(())
    }

    // ── Mount operations ─────────────────────────────────────────────

    /// Mount a secret engine and route it.
    ///
    /// # Errors
    ///
    /// Mount-table and registry errors, converted.
    pub async fn mount_engine(&self, entry: MountEntry) -> Result<(), CoreError> {
        self.require_active().await?;
        if !self.registry.contains(&entry.entry_type) {
            return Err(CoreError::from(crate::error::MountError::UnknownEngineType {
                engine_type: entry.entry_type,
            }));
        }

        let view = BarrierView::new(Arc::clone(&self.barrier), entry.storage_prefix())
            .with_seal_wrap(entry.seal_wrap);
        let engine = self.registry.create(&entry.entry_type, view)?;
        engine.initialize().await.map_err(CoreError::from)?;

        self.mounts.add(MountTableType::Secret, entry.clone()).await?;
        self.router.mount(entry, engine).await?;
        Ok(())
    }

    /// Unmount an engine: revoke all leases under its path, drop the
    /// route, persist the removal.
    ///
    /// # Errors
    ///
    /// Mount-table errors, converted.
    pub async fn unmount_engine(&self, path: &str) -> Result<(), CoreError> {
        self.require_active().await?;
        let normalized = crate::mount::normalize_mount_path(path.to_owned());

        self.expiration.revoke_prefix(&normalized, false).await?;
        let route = self.router.unmount(&normalized).await?;
        route.engine.cleanup().await;
        self.mounts.remove(MountTableType::Secret, &normalized).await?;
        Ok(())
    }

    /// Atomically rename a mount, rewriting its leases.
    ///
    /// # Errors
    ///
    /// Mount-table errors, converted.
    pub async fn remount_engine(&self, from: &str, to: &str) -> Result<(), CoreError> {
        self.require_active().await?;
        let from = crate::mount::normalize_mount_path(from.to_owned());
        let to = crate::mount::normalize_mount_path(to.to_owned());

        let updated = self.mounts.rename(MountTableType::Secret, &from, &to).await?;
        let route = self.router.unmount(&from).await?;
        self.router
            .mount(updated, Arc::clone(&route.engine))
            .await?;
        self.expiration.rewrite_prefix(&from, &to).await?;
        Ok(())
    }

    /// Tune a mount's config with check-and-set, refreshing the route.
    ///
    /// # Errors
    ///
    /// Mount-table errors, converted.
    pub async fn tune_mount(
        &self,
        path: &str,
        config: MountConfig,
        cas: Option<u64>,
    ) -> Result<MountEntry, CoreError> {
        self.require_active().await?;
        let normalized = crate::mount::normalize_mount_path(path.to_owned());
        let updated = self
            .mounts
            .tune(MountTableType::Secret, &normalized, config, cas)
            .await?;

        let route = self.router.unmount(&normalized).await?;
        self.router
            .mount(updated.clone(), Arc::clone(&route.engine))
            .await?;
        Ok(updated)
    }

    /// The secret mount table, for the listing endpoint.
    pub async fn list_mounts(&self) -> Vec<MountEntry> {
        self.mounts.list(MountTableType::Secret).await
    }

    async fn require_active(&self) -> Result<(), CoreError> {
        match *self.state.read().await {
            CoreState::Active => Ok(()),
            CoreState::Standby => Err(CoreError::Standby {
                leader_addr: self.leader_addr().await,
            }),
            _ => Err(CoreError::Sealed),
        }
    }

    // ── Authorization for system endpoints ───────────────────────────

    /// Validate a token and evaluate policy for a system path. Used by the
    /// transport's system handlers, which bypass the router.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Unauthorized`] for a missing/invalid token.
    /// - [`CoreError::PermissionDenied`] when policy denies, including
    ///   paths that demand `sudo` the token lacks.
    pub async fn authorize(
        &self,
        token: Option<&str>,
        path: &str,
        operation: Operation,
        require_sudo: bool,
    ) -> Result<TokenEntry, CoreError> {
        self.require_active().await?;
        let token = token.ok_or(CoreError::Unauthorized)?;
        let entry = self.tokens.lookup(token).await?;
        let entity = self.resolve_entity(&entry).await;
        let policy_names = self.effective_policies(&entry, entity.as_ref());

        let request = AclRequest {
            path,
            capability: operation.capability(),
            parameters: None,
            wrap_ttl: None,
            mfa_methods: &[],
            policy_override: false,
        };
        let decision = self
            .policies
            .evaluate(&policy_names, entity.as_ref(), &request)
            .await?;
        if !decision.allowed {
            return Err(CoreError::PermissionDenied);
        }
        if require_sudo && !(decision.sudo || decision.root) {
            return Err(CoreError::PermissionDenied);
        }
        Ok(entry)
    }

    async fn resolve_entity(&self, entry: &TokenEntry) -> Option<Entity> {
        let id = entry.entity_id.as_deref()?;
        self.identity.get(id).await.ok()
    }

    fn effective_policies(&self, entry: &TokenEntry, entity: Option<&Entity>) -> Vec<String> {
        let mut names = entry.policies.clone();
        if let Some(entity) = entity {
            for p in &entity.policies {
                if !names.contains(p) {
                    names.push(p.clone());
                }
            }
        }
        names
    }

    // ── The request pipeline ─────────────────────────────────────────

    /// Handle one logical request end to end.
    ///
    /// # Errors
    ///
    /// The full [`CoreError`] taxonomy; the transport maps kinds onto
    /// status codes.
    pub async fn handle_request(&self, req: Request) -> Result<CoreResponse, CoreError> {
        let request_id = req.id.clone();
        let operation = req.operation;
        let path = req.path.clone();
        let token_hmac = req
            .token
            .as_deref()
            .map_or_else(String::new, |t| self.audit.hmac_field(t));

        let deadline = std::time::Duration::from_secs(self.config.request_timeout_secs);
        let result = match tokio::time::timeout(deadline, self.handle_inner(req)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout),
        };

        // Audit before the response leaves. A failed broadcast fails the
        // request even when the handling succeeded.
        let (outcome, policies, warnings) = match &result {
            Ok((response, policies)) => {
                ("success".to_owned(), policies.clone(), response.warnings.clone())
            }
            Err(e) => (e.to_string(), Vec::new(), Vec::new()),
        };
        let entry = AuditEntry {
            id: request_id,
            timestamp: Utc::now(),
            operation: format!("{operation:?}").to_lowercase(),
            path,
            token_hmac,
            policies,
            outcome,
            warnings,
        };
        if let Err(audit_err) = self.audit.log(&entry).await {
            error!(error = %audit_err, "audit broadcast failed; failing request");
            return Err(CoreError::Internal {
                reason: "audit sinks unavailable".to_owned(),
            });
        }

        result.map(|(response, _)| response)
    }

    async fn handle_inner(
        &self,
        req: Request,
    ) -> Result<(CoreResponse, Vec<String>), CoreError> {
        // State check under the shared state lock, held for the duration.
        let state = self.state.read().await;
        match *state {
            CoreState::Active => {}
            CoreState::Standby => {
                return Err(CoreError::Standby {
                    leader_addr: self.leader_addr().await,
                })
            }
            _ => return Err(CoreError::Sealed),
        }

        let path = req.path.trim_start_matches('/').to_owned();
        if path.is_empty() {
            return Err(CoreError::InvalidRequest {
                reason: "empty request path".to_owned(),
            });
        }
        if path.starts_with("sys/") {
            return Err(CoreError::InvalidRequest {
                reason: "system paths are served by the system API".to_owned(),
            });
        }

        // Reject unsupported wrapping formats before doing any work. The
        // opaque cubbyhole token is the only served format; JWT-shaped
        // wrapping belongs to a signing facility this node does not carry.
        if let Some(format) = req.wrap_format.as_deref() {
            if format != "token" {
                return Err(CoreError::InvalidRequest {
                    reason: format!(
                        "unsupported wrapping format '{format}': only 'token' is available"
                    ),
                });
            }
        }

        // Token validation.
        let token = req.token.as_deref().ok_or(CoreError::Unauthorized)?;
        let token_entry = self.tokens.lookup(token).await?;
        if !token_entry.bound_cidrs.is_empty() {
            let addr = req.client_addr.as_deref().unwrap_or("");
            if !cidr_match(&token_entry.bound_cidrs, addr) {
                return Err(CoreError::Unauthorized);
            }
        }

        // Policy evaluation against the resolved entity.
        let entity = self.resolve_entity(&token_entry).await;
        let policy_names = self.effective_policies(&token_entry, entity.as_ref());
        let parameters = req.data.as_ref().and_then(serde_json::Value::as_object);
        let acl_request = AclRequest {
            path: &path,
            capability: req.operation.capability(),
            parameters,
            wrap_ttl: req.wrap_ttl,
            mfa_methods: &req.mfa_methods,
            policy_override: req.policy_override,
        };
        let decision = self
            .policies
            .evaluate(&policy_names, entity.as_ref(), &acl_request)
            .await?;
        if !decision.allowed {
            return Err(CoreError::PermissionDenied);
        }

        // Clamp pagination to the policy's ceiling.
        let page = match (req.page.clone(), decision.pagination_limit) {
            (Some(mut page), Some(limit)) => {
                if page.limit < 0 || page.limit > limit {
                    page.limit = limit;
                }
                Some(page)
            }
            (page, _) => page,
        };

        // Dispatch.
        let mut response = CoreResponse::empty(req.id.clone());
        let (engine_response, premade_auth) = if path == "auth/token"
            || path.starts_with("auth/token/")
        {
            self.token_backend(&req, &path, token, &token_entry, decision.root || decision.sudo)
                .await?
        } else {
            let (route, remainder) =
                self.router
                    .resolve(&path)
                    .await
                    .ok_or_else(|| CoreError::NotFound {
                        path: path.clone(),
                    })?;
            let engine_request = EngineRequest {
                operation: req.operation,
                path: remainder,
                data: req.data.clone(),
                token_accessor: Some(token_entry.accessor.clone()),
                page,
            };
            let handled = route
                .engine
                .handle(engine_request)
                .await
                .map_err(CoreError::from)?;
            (handled, None)
        };

        response.data = engine_response.data;
        response.warnings = engine_response.warnings;
        if decision.overridden {
            response
                .warnings
                .push("soft-mandatory policy overridden".to_owned());
        }

        // Secret lease registration.
        if let Some(secret) = engine_response.secret {
            if secret.ttl_secs > 0 {
                let ttl = secret.ttl_secs.min(self.config.max_lease_ttl);
                let lease = self
                    .expiration
                    .register(RegisterLease {
                        client_token_hash: token_entry.id_hash.clone(),
                        path: path.clone(),
                        secret_data: Some(
                            secret.internal_data.unwrap_or(serde_json::Value::Null),
                        ),
                        auth_data: None,
                        ttl_secs: ttl,
                        max_ttl_secs: secret.max_ttl_secs.or(Some(self.config.max_lease_ttl)),
                        renewable: secret.renewable,
                        namespace: req.namespace.clone(),
                    })
                    .await?;
                response.lease_id = Some(lease.lease_id);
                response.lease_duration = Some(ttl);
                response.renewable = secret.renewable;
            }
        }

        // Auth block: the token backend mints its own; engine login flows
        // hand back a grant the core turns into a service token.
        if let Some(info) = premade_auth {
            response.auth = Some(info);
        } else if let Some(auth) = engine_response.auth {
            let info = self.issue_auth_token(&auth, &req.namespace).await?;
            response.auth = Some(info);
        }

        // Response wrapping.
        if let Some(wrap_ttl) = req.wrap_ttl {
            let wrapped = self.wrap_response(&response, wrap_ttl).await?;
            let mut envelope = CoreResponse::empty(response.request_id.clone());
            envelope.wrap_info = Some(wrapped);
            return Ok((envelope, policy_names));
        }

        Ok((response, policy_names))
    }

    // ── Token backend (auth/token/*) ─────────────────────────────────

    async fn token_backend(
        &self,
        req: &Request,
        path: &str,
        raw_token: &str,
        caller: &TokenEntry,
        privileged: bool,
    ) -> Result<(EngineResponse, Option<AuthInfo>), CoreError> {
        let sub = path.trim_start_matches("auth/token").trim_start_matches('/');
        match (req.operation, sub) {
            (Operation::Create | Operation::Update, "create") => {
                let auth = self.token_create(req, caller, privileged, false).await?;
                Ok((EngineResponse::empty(), Some(auth)))
            }
            (Operation::Create | Operation::Update, "create-orphan") => {
                if !privileged {
                    return Err(CoreError::PermissionDenied);
                }
                let auth = self.token_create(req, caller, privileged, true).await?;
                Ok((EngineResponse::empty(), Some(auth)))
            }
            (Operation::Read, "lookup-self") => {
                Ok((EngineResponse::with_data(token_data(caller)), None))
            }
            (Operation::Create | Operation::Update, "renew-self") => {
                let increment = body_i64(req, "increment")
                    .unwrap_or(self.config.default_lease_ttl);
                let entry = self.tokens.renew(raw_token, increment).await?;
                // Keep the auth lease aligned with the token expiry.
                for lease in self
                    .expiration
                    .leases_for_token(&entry.id_hash)
                    .await?
                {
                    if lease.is_auth() {
                        let _ = self.expiration.renew(&lease.lease_id, increment).await;
                    }
                }
                Ok((EngineResponse::with_data(token_data(&entry)), None))
            }
            (Operation::Create | Operation::Update, "revoke-self") => {
                self.revoke_token_tree(&caller.id_hash).await?;
                Ok((EngineResponse::empty(), None))
            }
            (Operation::Create | Operation::Update | Operation::Read, "lookup") => {
                let target = body_str(req, "token").ok_or_else(|| CoreError::InvalidRequest {
                    reason: "missing 'token' parameter".to_owned(),
                })?;
                let entry = self.tokens.lookup(&target).await?;
                Ok((EngineResponse::with_data(token_data(&entry)), None))
            }
            (Operation::Create | Operation::Update, "renew") => {
                let target = body_str(req, "token").ok_or_else(|| CoreError::InvalidRequest {
                    reason: "missing 'token' parameter".to_owned(),
                })?;
                let increment = body_i64(req, "increment")
                    .unwrap_or(self.config.default_lease_ttl);
                let entry = self.tokens.renew(&target, increment).await?;
                Ok((EngineResponse::with_data(token_data(&entry)), None))
            }
            (Operation::Create | Operation::Update, "revoke") => {
                let target = body_str(req, "token").ok_or_else(|| CoreError::InvalidRequest {
                    reason: "missing 'token' parameter".to_owned(),
                })?;
                let hash = crate::token::hash_token(&target);
                self.revoke_token_tree(&hash).await?;
                Ok((EngineResponse::empty(), None))
            }
            (Operation::Create | Operation::Update, "revoke-accessor") => {
                let accessor =
                    body_str(req, "accessor").ok_or_else(|| CoreError::InvalidRequest {
                        reason: "missing 'accessor' parameter".to_owned(),
                    })?;
                let entry = self.tokens.lookup_by_accessor(&accessor).await?;
                self.revoke_token_tree(&entry.id_hash).await?;
                Ok((EngineResponse::empty(), None))
            }
            _ => Err(CoreError::InvalidRequest {
                reason: format!("unsupported token operation '{sub}'"),
            }),
        }
    }

    async fn token_create(
        &self,
        req: &Request,
        caller: &TokenEntry,
        privileged: bool,
        orphan: bool,
    ) -> Result<AuthInfo, CoreError> {
        let body = req.data.clone().unwrap_or(serde_json::json!({}));

        let policies: Vec<String> = body
            .get("policies")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| caller.policies.clone());

        // A token may not grant itself policies its creator lacks.
        if !privileged {
            for p in &policies {
                if p != "default" && !caller.policies.contains(p) {
                    return Err(CoreError::PermissionDenied);
                }
            }
        }

        let ttl = body_i64(req, "ttl")
            .unwrap_or(self.config.default_lease_ttl)
            .min(self.config.max_lease_ttl);
        let display_name = body_str(req, "display_name").unwrap_or_else(|| "token".to_owned());
        let period = body_i64(req, "period");
        if period.is_some() && !privileged {
            return Err(CoreError::PermissionDenied);
        }

        let token_type = body_str(req, "type").unwrap_or_else(|| "service".to_owned());
        if token_type == "batch" {
            let token = self
                .tokens
                .create_batch(policies.clone(), ttl, caller.entity_id.clone(), display_name)
                .await?;
            return Ok(AuthInfo {
                client_token: token,
                accessor: String::new(),
                policies,
                lease_duration: ttl,
                renewable: false,
                entity_id: caller.entity_id.clone(),
                token_type: "batch".to_owned(),
                orphan: true,
            });
        }

        let meta: HashMap<String, String> = body
            .get("meta")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let (token, entry) = self
            .tokens
            .create(CreateTokenParams {
                policies,
                ttl_secs: Some(ttl),
                explicit_max_ttl: body_i64(req, "explicit_max_ttl"),
                period,
                parent_hash: Some(caller.id_hash.clone()),
                orphan,
                entity_id: caller.entity_id.clone(),
                meta,
                bound_cidrs: Vec::new(),
                display_name,
            })
            .await?;

        // Every non-root service token carries exactly one auth lease.
        self.expiration
            .register(RegisterLease {
                client_token_hash: entry.id_hash.clone(),
                path: "auth/token/create".to_owned(),
                secret_data: None,
                auth_data: Some(serde_json::json!({
                    "accessor": entry.accessor,
                    "id_hash": entry.id_hash,
                })),
                ttl_secs: entry.ttl_secs(Utc::now()),
                max_ttl_secs: entry.explicit_max_ttl,
                renewable: true,
                namespace: req.namespace.clone(),
            })
            .await?;

        Ok(AuthInfo {
            client_token: token,
            accessor: entry.accessor.clone(),
            policies: entry.policies.clone(),
            lease_duration: entry.ttl_secs(Utc::now()),
            renewable: true,
            entity_id: entry.entity_id.clone(),
            token_type: "service".to_owned(),
            orphan: entry.orphan,
        })
    }

    /// Mint a service token for an auth engine's login grant.
    async fn issue_auth_token(
        &self,
        auth: &AuthSpec,
        namespace: &str,
    ) -> Result<AuthInfo, CoreError> {
        let ttl = auth
            .ttl_secs
            .unwrap_or(self.config.default_lease_ttl)
            .min(self.config.max_lease_ttl);
        let (token, entry) = self
            .tokens
            .create(CreateTokenParams {
                policies: auth.policies.clone(),
                ttl_secs: Some(ttl),
                explicit_max_ttl: None,
                period: None,
                parent_hash: None,
                orphan: true,
                entity_id: auth.entity_id.clone(),
                meta: HashMap::new(),
                bound_cidrs: Vec::new(),
                display_name: auth.display_name.clone(),
            })
            .await?;

        self.expiration
            .register(RegisterLease {
                client_token_hash: entry.id_hash.clone(),
                path: "auth/login".to_owned(),
                secret_data: None,
                auth_data: Some(serde_json::json!({
                    "accessor": entry.accessor,
                    "id_hash": entry.id_hash,
                })),
                ttl_secs: ttl,
                max_ttl_secs: None,
                renewable: auth.renewable,
                namespace: namespace.to_owned(),
            })
            .await?;

        Ok(AuthInfo {
            client_token: token,
            accessor: entry.accessor.clone(),
            policies: entry.policies.clone(),
            lease_duration: ttl,
            renewable: auth.renewable,
            entity_id: entry.entity_id.clone(),
            token_type: "service".to_owned(),
            orphan: true,
        })
    }

    /// Revoke a token subtree along with every lease it holds.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures; engine-side failures leave leases
    /// queued for the background loop.
    pub async fn revoke_token_tree(&self, id_hash: &str) -> Result<(), CoreError> {
        let entries = self.tokens.subtree(id_hash).await?;
        self.tokens.revoke_by_hash(id_hash).await?;
        for entry in &entries {
            if let Err(e) = self.expiration.revoke_by_token(&entry.id_hash).await {
                warn!(error = %e, "lease cleanup during token revocation deferred");
            }
            let _ = self.cubbyhole.clear_for_accessor(&entry.accessor).await;
        }
        Ok(())
    }

    // ── Response wrapping ────────────────────────────────────────────

    async fn wrap_response(
        &self,
        response: &CoreResponse,
        wrap_ttl: i64,
    ) -> Result<WrapInfo, CoreError> {
        let (wrap_token, wrap_entry) = self
            .tokens
            .create(CreateTokenParams {
                policies: vec!["response-wrapping".to_owned()],
                ttl_secs: Some(wrap_ttl),
                orphan: true,
                display_name: WRAPPING_TOKEN_NAME.to_owned(),
                ..CreateTokenParams::default()
            })
            .await?;

        let payload = serde_json::to_value(response).map_err(CoreError::internal)?;
        self.cubbyhole
            .handle(EngineRequest {
                operation: Operation::Update,
                path: WRAPPED_RESPONSE_PATH.to_owned(),
                data: Some(serde_json::json!({ "response": payload })),
                token_accessor: Some(wrap_entry.accessor.clone()),
                page: None,
            })
            .await
            .map_err(CoreError::from)?;

        Ok(WrapInfo {
            token: wrap_token,
            ttl: wrap_ttl,
            format: "token".to_owned(),
            creation_time: Utc::now(),
        })
    }

    /// Unwrap a cubbyhole-wrapped response. Single use: the wrapping token
    /// is revoked on success.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Unauthorized`] for an unknown/expired wrapping token.
    /// - [`CoreError::InvalidRequest`] for a non-wrapping token.
    pub async fn unwrap_response(
        &self,
        wrapping_token: &str,
    ) -> Result<serde_json::Value, CoreError> {
        self.require_active().await?;
        let entry = self.tokens.lookup(wrapping_token).await?;
        if entry.display_name != WRAPPING_TOKEN_NAME {
            return Err(CoreError::InvalidRequest {
                reason: "token is not a response-wrapping token".to_owned(),
            });
        }

        let response = self
            .cubbyhole
            .handle(EngineRequest {
                operation: Operation::Read,
                path: WRAPPED_RESPONSE_PATH.to_owned(),
                data: None,
                token_accessor: Some(entry.accessor.clone()),
                page: None,
            })
            .await
            .map_err(CoreError::from)?;

        // Single use.
        self.revoke_token_tree(&entry.id_hash).await?;

        let mut data = response.data.ok_or_else(|| CoreError::NotFound {
            path: "sys/wrapping/unwrap".to_owned(),
        })?;
        Ok(data
            .get_mut("response")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

fn token_data(entry: &TokenEntry) -> serde_json::Value {
    serde_json::json!({
        "accessor": entry.accessor,
        "policies": entry.policies,
        "creation_time": entry.creation_time.to_rfc3339(),
        "expire_time": entry.expires_at.map(|t| t.to_rfc3339()),
        "ttl": entry.ttl_secs(Utc::now()),
        "explicit_max_ttl": entry.explicit_max_ttl,
        "period": entry.period,
        "entity_id": entry.entity_id,
        "type": match entry.token_type { TokenType::Service => "service", TokenType::Batch => "batch" },
        "orphan": entry.orphan,
        "display_name": entry.display_name,
        "meta": entry.meta,
    })
}

fn body_str(req: &Request, key: &str) -> Option<String> {
    req.data
        .as_ref()?
        .get(key)?
        .as_str()
        .map(str::to_owned)
}

fn body_i64(req: &Request, key: &str) -> Option<i64> {
    req.data.as_ref()?.get(key)?.as_i64()
}

/// Revokes leases on behalf of the expiration manager: auth leases revoke
/// their token (and its remaining secret leases); secret leases dispatch
/// back to the issuing engine.
struct CoreRevoker {
    core: Weak<Core>,
}

#[async_trait::async_trait]
impl LeaseRevoker for CoreRevoker {
    async fn revoke(&self, lease: &LeaseEntry) -> Result<(), LogicalError> {
        let core = self.core.upgrade().ok_or(LogicalError::Upstream {
            reason: "core shut down".to_owned(),
        })?;

        if let Some(auth) = &lease.auth_data {
            let id_hash = auth.get("id_hash").and_then(|v| v.as_str()).unwrap_or("");
            let accessor = auth.get("accessor").and_then(|v| v.as_str()).unwrap_or("");

            if !id_hash.is_empty() {
                match core.tokens.revoke_by_hash(id_hash).await {
                    Ok(()) | Err(TokenError::NotFound) => {}
                    Err(e) => {
                        return Err(LogicalError::Internal {
                            reason: e.to_string(),
                        })
                    }
                }
                // Remaining secret leases of the expired token. The auth
                // lease currently being revoked is skipped to avoid
                // re-entering this path.
                if let Ok(leases) = core.expiration.leases_for_token(id_hash).await {
                    for other in leases {
                        if !other.is_auth() && other.lease_id != lease.lease_id {
                            let _ = core.expiration.revoke(&other.lease_id, false).await;
                        }
                    }
                }
            }
            if !accessor.is_empty() {
                let _ = core.cubbyhole.clear_for_accessor(accessor).await;
            }
            return Ok(());
        }

        // Secret lease: hand the engine its internal data back.
        match core.router.resolve(&lease.path).await {
            Some((route, remainder)) => {
                let request = EngineRequest {
                    operation: Operation::Revoke,
                    path: remainder,
                    data: lease.secret_data.clone(),
                    token_accessor: None,
                    page: None,
                };
                match route.engine.handle(request).await {
                    Ok(_) | Err(LogicalError::UnsupportedOperation) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            // The mount is gone; nothing left to contact.
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditSink, MemorySink};
    use crate::error::AuditError;
    use crate::policy::{Capability, PathRule, Policy};
    use crate::rekey::{RekeyConfig, RekeyMode, RekeyOutcome, RekeyTarget};
    use crate::seal::AeadKeyWrapper;
    use citadel_storage::MemoryBackend;

    fn test_config(node_id: &str) -> CoreConfig {
        CoreConfig {
            node_id: node_id.to_owned(),
            api_addr: format!("http://{node_id}:8200"),
            ..CoreConfig::default()
        }
    }

    async fn new_core(storage: Arc<MemoryBackend>, node_id: &str) -> Arc<Core> {
        Core::new(
            storage as Arc<dyn StorageBackend>,
            SealProvider::Shamir,
            test_config(node_id),
        )
        .await
        .unwrap()
    }

    async fn initialized_core() -> (Arc<Core>, InitResult, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let core = new_core(Arc::clone(&storage), "node-a").await;
        let init = core
            .initialize(InitParams {
                secret_shares: 5,
                secret_threshold: 3,
                recovery_shares: 0,
                recovery_threshold: 0,
            })
            .await
            .unwrap();
        (core, init, storage)
    }

    fn decode_share(b64: &str) -> Vec<u8> {
        B64.decode(b64).unwrap()
    }

    fn write_secret(path: &str, token: &str, value: serde_json::Value) -> Request {
        Request::new(Operation::Update, path)
            .with_token(token)
            .with_data(serde_json::json!({ "data": value }))
    }

    // ── Scenario: init → write → seal → unseal → read ────────────────

    #[tokio::test]
    async fn init_write_seal_unseal_read() {
        let (core, init, _storage) = initialized_core().await;
        assert_eq!(core.state().await, CoreState::Active);
        assert_eq!(init.key_shares.len(), 5);

        core.handle_request(write_secret(
            "secret/data/hello",
            &init.root_token,
            serde_json::json!({"v": "world"}),
        ))
        .await
        .unwrap();

        core.seal_core().await.unwrap();
        assert_eq!(core.state().await, CoreState::Sealed);
        let err = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/hello").with_token(&init.root_token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Sealed));

        // Submit shares out of order: s2, s4, s1.
        for (i, expect_sealed) in [(1, true), (3, true), (0, false)] {
            let outcome = core
                .submit_unseal_share(decode_share(&init.key_shares[i]))
                .await
                .unwrap();
            assert_eq!(outcome.sealed, expect_sealed);
        }
        assert_eq!(core.state().await, CoreState::Active);

        let response = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/hello").with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], "world");
    }

    #[tokio::test]
    async fn sealing_twice_is_a_noop() {
        let (core, _, _) = initialized_core().await;
        core.seal_core().await.unwrap();
        core.seal_core().await.unwrap();
        assert_eq!(core.state().await, CoreState::Sealed);
    }

    #[tokio::test]
    async fn duplicate_unseal_share_is_idempotent() {
        let (core, init, _) = initialized_core().await;
        core.seal_core().await.unwrap();

        let share = decode_share(&init.key_shares[0]);
        let first = core.submit_unseal_share(share.clone()).await.unwrap();
        assert_eq!(first.progress, 1);
        let second = core.submit_unseal_share(share).await.unwrap();
        assert_eq!(second.progress, 1);
    }

    #[tokio::test]
    async fn wrong_shares_reset_progress() {
        let (core, init, _) = initialized_core().await;
        core.seal_core().await.unwrap();

        // Shares from an unrelated split decode but unwrap nothing.
        let stranger = EncryptionKey::generate();
        let bogus = split_key(stranger.as_bytes(), 5, 3).unwrap();
        for share in bogus.iter().take(2) {
            core.submit_unseal_share(share.clone()).await.unwrap();
        }
        let err = core.submit_unseal_share(bogus[2].clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));

        let status = core.seal_status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.progress, 0);

        // The real shares still work afterwards.
        for share in init.key_shares.iter().take(3) {
            let _ = core.submit_unseal_share(decode_share(share)).await.unwrap();
        }
        assert_eq!(core.state().await, CoreState::Active);
    }

    #[tokio::test]
    async fn init_twice_conflicts() {
        let (core, _, _) = initialized_core().await;
        let err = core
            .initialize(InitParams {
                secret_shares: 3,
                secret_threshold: 2,
                recovery_shares: 0,
                recovery_threshold: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    // ── Policy enforcement ───────────────────────────────────────────

    #[tokio::test]
    async fn powerless_token_is_denied_and_root_is_not() {
        let (core, init, _) = initialized_core().await;

        let (token, _) = core
            .tokens()
            .create(CreateTokenParams {
                policies: vec![],
                ttl_secs: Some(3600),
                display_name: "powerless".to_owned(),
                ..CreateTokenParams::default()
            })
            .await
            .unwrap();

        let err = core
            .handle_request(Request::new(Operation::Read, "secret/data/x").with_token(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));

        // Root reads freely (404 is post-authorization).
        let err = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/x").with_token(&init.root_token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let (core, _, _) = initialized_core().await;
        let err = core
            .handle_request(Request::new(Operation::Read, "secret/data/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized));
    }

    // ── Scenario: policy template expansion ──────────────────────────

    #[tokio::test]
    async fn entity_template_policy_scopes_writes() {
        let (core, _, _) = initialized_core().await;

        let entity = core
            .identity()
            .create("service-a", Vec::new(), HashMap::new(), Vec::new())
            .await
            .unwrap();

        core.policies()
            .set(
                Policy {
                    name: "p".to_owned(),
                    paths: vec![PathRule::new(
                        "secret/data/{{identity.entity.id}}/*",
                        vec![Capability::Read, Capability::Update],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let (token, _) = core
            .tokens()
            .create(CreateTokenParams {
                policies: vec!["p".to_owned()],
                ttl_secs: Some(3600),
                entity_id: Some(entity.id.clone()),
                display_name: "templated".to_owned(),
                ..CreateTokenParams::default()
            })
            .await
            .unwrap();

        let own_path = format!("secret/data/{}/x", entity.id);
        core.handle_request(write_secret(&own_path, &token, serde_json::json!({"a": 1})))
            .await
            .unwrap();

        let err = core
            .handle_request(write_secret(
                "secret/data/E999/x",
                &token,
                serde_json::json!({"a": 1}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));
    }

    // ── Scenario: list pagination ────────────────────────────────────

    #[tokio::test]
    async fn list_pagination_closure() {
        let (core, init, _) = initialized_core().await;
        for i in 1..=10 {
            core.handle_request(write_secret(
                &format!("secret/data/a/{i:02}"),
                &init.root_token,
                serde_json::json!({"n": i}),
            ))
            .await
            .unwrap();
        }

        let mut collected = Vec::new();
        let mut after = String::new();
        loop {
            let mut req =
                Request::new(Operation::List, "secret/data/a").with_token(&init.root_token);
            req.page = Some(PageArgs {
                after: after.clone(),
                limit: 3,
            });
            let response = core.handle_request(req).await.unwrap();
            let keys: Vec<String> =
                serde_json::from_value(response.data.unwrap()["keys"].clone()).unwrap();
            if keys.is_empty() {
                break;
            }
            after = keys.last().unwrap().clone();
            collected.extend(keys);
        }
        let expected: Vec<String> = (1..=10).map(|i| format!("{i:02}")).collect();
        assert_eq!(collected, expected);
    }

    // ── Scenario: parent-token revocation cascade ────────────────────

    #[tokio::test]
    async fn parent_revocation_takes_children_and_leases() {
        let (core, init, _) = initialized_core().await;

        // Policy allowing token management for the parent.
        core.policies()
            .set(
                Policy {
                    name: "token-maker".to_owned(),
                    paths: vec![PathRule::new(
                        "auth/token/*",
                        vec![Capability::Create, Capability::Update, Capability::Read],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        // P, via the root token.
        let response = core
            .handle_request(
                Request::new(Operation::Update, "auth/token/create")
                    .with_token(&init.root_token)
                    .with_data(serde_json::json!({
                        "policies": ["default", "token-maker"],
                        "ttl": 3600,
                        "display_name": "parent",
                    })),
            )
            .await
            .unwrap();
        let parent = response.auth.unwrap();

        // C, created by P.
        let response = core
            .handle_request(
                Request::new(Operation::Update, "auth/token/create")
                    .with_token(&parent.client_token)
                    .with_data(serde_json::json!({
                        "policies": ["default"],
                        "ttl": 3600,
                        "display_name": "child",
                    })),
            )
            .await
            .unwrap();
        let child = response.auth.unwrap();

        // A secret lease issued under C.
        let child_entry = core.tokens().lookup(&child.client_token).await.unwrap();
        let lease = core
            .expiration()
            .register(RegisterLease {
                client_token_hash: child_entry.id_hash.clone(),
                path: "database/creds/readonly".to_owned(),
                secret_data: Some(serde_json::json!({"username": "v-child"})),
                auth_data: None,
                ttl_secs: 600,
                max_ttl_secs: None,
                renewable: true,
                namespace: String::new(),
            })
            .await
            .unwrap();

        // Revoke P; C and L must both be gone.
        core.handle_request(
            Request::new(Operation::Update, "auth/token/revoke")
                .with_token(&init.root_token)
                .with_data(serde_json::json!({"token": parent.client_token})),
        )
        .await
        .unwrap();

        assert!(core.tokens().lookup(&parent.client_token).await.is_err());
        assert!(core.tokens().lookup(&child.client_token).await.is_err());
        assert!(core.expiration().lookup(&lease.lease_id).await.is_err());
    }

    #[tokio::test]
    async fn child_cannot_exceed_parent_policies() {
        let (core, init, _) = initialized_core().await;
        core.policies()
            .set(
                Policy {
                    name: "limited".to_owned(),
                    paths: vec![PathRule::new(
                        "auth/token/*",
                        vec![Capability::Create, Capability::Update],
                    )],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let response = core
            .handle_request(
                Request::new(Operation::Update, "auth/token/create")
                    .with_token(&init.root_token)
                    .with_data(serde_json::json!({"policies": ["limited"], "ttl": 3600})),
            )
            .await
            .unwrap();
        let limited = response.auth.unwrap();

        let err = core
            .handle_request(
                Request::new(Operation::Update, "auth/token/create")
                    .with_token(&limited.client_token)
                    .with_data(serde_json::json!({"policies": ["root"], "ttl": 60})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));
    }

    #[tokio::test]
    async fn batch_token_creation_and_use() {
        let (core, init, _) = initialized_core().await;
        let response = core
            .handle_request(
                Request::new(Operation::Update, "auth/token/create")
                    .with_token(&init.root_token)
                    .with_data(serde_json::json!({
                        "policies": ["root"],
                        "ttl": 300,
                        "type": "batch",
                    })),
            )
            .await
            .unwrap();
        let batch = response.auth.unwrap();
        assert!(batch.client_token.starts_with("b."));
        assert!(!batch.renewable);

        // The batch token authenticates without any stored state.
        core.handle_request(write_secret(
            "secret/data/from-batch",
            &batch.client_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();
    }

    // ── Standby / forwarding ─────────────────────────────────────────

    #[tokio::test]
    async fn standby_refuses_with_leader_address() {
        let storage = Arc::new(MemoryBackend::new());
        let core_a = new_core(Arc::clone(&storage), "node-a").await;
        let init = core_a
            .initialize(InitParams {
                secret_shares: 3,
                secret_threshold: 2,
                recovery_shares: 0,
                recovery_threshold: 0,
            })
            .await
            .unwrap();

        let core_b = new_core(Arc::clone(&storage), "node-b").await;
        assert_eq!(core_b.state().await, CoreState::Sealed);
        for share in init.key_shares.iter().take(2) {
            let _ = core_b
                .submit_unseal_share(decode_share(share))
                .await
                .unwrap();
        }
        assert_eq!(core_b.state().await, CoreState::Standby);

        let err = core_b
            .handle_request(
                Request::new(Operation::Read, "secret/data/x").with_token(&init.root_token),
            )
            .await
            .unwrap_err();
        match err {
            CoreError::Standby { leader_addr } => {
                assert_eq!(leader_addr.as_deref(), Some("http://node-a:8200"));
            }
            other => panic!("expected standby error, got {other:?}"),
        }

        // Step-down hands leadership to the standby on its next tick.
        core_a.step_down().await.unwrap();
        core_b.ha_tick().await.unwrap();
        assert_eq!(core_b.state().await, CoreState::Active);
    }

    // ── Response wrapping ────────────────────────────────────────────

    #[tokio::test]
    async fn wrap_then_unwrap_roundtrip() {
        let (core, init, _) = initialized_core().await;
        core.handle_request(write_secret(
            "secret/data/wrapme",
            &init.root_token,
            serde_json::json!({"v": "hidden"}),
        ))
        .await
        .unwrap();

        let mut req =
            Request::new(Operation::Read, "secret/data/wrapme").with_token(&init.root_token);
        req.wrap_ttl = Some(120);
        let response = core.handle_request(req).await.unwrap();
        assert!(response.data.is_none());
        let wrap = response.wrap_info.unwrap();
        assert_eq!(wrap.ttl, 120);

        let unwrapped = core.unwrap_response(&wrap.token).await.unwrap();
        assert_eq!(unwrapped["data"]["data"]["v"], "hidden");

        // Single use.
        assert!(core.unwrap_response(&wrap.token).await.is_err());
    }

    #[tokio::test]
    async fn unsupported_wrap_format_rejected() {
        let (core, init, _) = initialized_core().await;
        let mut req =
            Request::new(Operation::Read, "secret/data/x").with_token(&init.root_token);
        req.wrap_ttl = Some(120);
        req.wrap_format = Some("jwt".to_owned());
        let err = core.handle_request(req).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn token_wrap_format_is_accepted_and_reported() {
        let (core, init, _) = initialized_core().await;
        core.handle_request(write_secret(
            "secret/data/fmt",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        let mut req =
            Request::new(Operation::Read, "secret/data/fmt").with_token(&init.root_token);
        req.wrap_ttl = Some(120);
        req.wrap_format = Some("token".to_owned());
        let response = core.handle_request(req).await.unwrap();
        assert_eq!(response.wrap_info.unwrap().format, "token");
    }

    #[tokio::test]
    async fn policy_override_bypasses_soft_deny_with_warning() {
        let (core, init, _) = initialized_core().await;

        let mut soft_deny = PathRule::new("secret/data/frozen/*", vec![Capability::Deny]);
        soft_deny.soft_mandatory = true;
        core.policies()
            .set(
                Policy {
                    name: "frozen".to_owned(),
                    paths: vec![
                        PathRule::new(
                            "secret/data/frozen/*",
                            vec![Capability::Read, Capability::Update],
                        ),
                        soft_deny,
                    ],
                    cas_version: 0,
                },
                None,
            )
            .await
            .unwrap();

        let (token, _) = core
            .tokens()
            .create(CreateTokenParams {
                policies: vec!["frozen".to_owned()],
                ttl_secs: Some(3600),
                display_name: "frozen-user".to_owned(),
                ..CreateTokenParams::default()
            })
            .await
            .unwrap();

        // Denied without the override header.
        let err = core
            .handle_request(write_secret(
                "secret/data/frozen/db",
                &token,
                serde_json::json!({"v": 1}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));

        // Allowed with it, and the bypass is called out.
        let mut req = write_secret(
            "secret/data/frozen/db",
            &token,
            serde_json::json!({"v": 1}),
        );
        req.policy_override = true;
        let response = core.handle_request(req).await.unwrap();
        assert!(response
            .warnings
            .iter()
            .any(|w| w.contains("soft-mandatory")));
    }

    #[tokio::test]
    async fn ordinary_token_cannot_unwrap() {
        let (core, init, _) = initialized_core().await;
        let err = core.unwrap_response(&init.root_token).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    // ── Auto-unseal ──────────────────────────────────────────────────

    #[tokio::test]
    async fn auto_unseal_with_external_wrapper() {
        let storage = Arc::new(MemoryBackend::new());
        let wrapper = Arc::new(AeadKeyWrapper::new(EncryptionKey::generate(), "kms-key-7"));
        let core = Core::new(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            SealProvider::External(wrapper),
            test_config("node-kms"),
        )
        .await
        .unwrap();

        let init = core
            .initialize(InitParams {
                secret_shares: 0,
                secret_threshold: 0,
                recovery_shares: 5,
                recovery_threshold: 3,
            })
            .await
            .unwrap();
        assert!(init.key_shares.is_empty());
        assert_eq!(init.recovery_shares.len(), 5);

        core.handle_request(write_secret(
            "secret/data/auto",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        core.seal_core().await.unwrap();
        // No shares needed: the wrapper unwraps the root key directly.
        core.auto_unseal().await.unwrap();
        assert_eq!(core.state().await, CoreState::Active);

        let response = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/auto").with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], 1);
    }

    #[tokio::test]
    async fn shamir_seal_rejects_auto_unseal() {
        let (core, _, _) = initialized_core().await;
        core.seal_core().await.unwrap();
        let err = core.auto_unseal().await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    // ── Generate-root ceremony ───────────────────────────────────────

    #[tokio::test]
    async fn generate_root_produces_working_token() {
        let (core, init, _) = initialized_core().await;
        let (nonce, otp_b64) = core.generate_root_init().await.unwrap();
        let otp = B64.decode(otp_b64).unwrap();

        let mut outcome = None;
        for share in init.key_shares.iter().take(3) {
            outcome = Some(
                core.generate_root_update(&nonce, decode_share(share))
                    .await
                    .unwrap(),
            );
        }
        let GenerateRootOutcome::Complete { encoded_token } = outcome.unwrap() else {
            panic!("ceremony did not complete at the threshold");
        };

        let masked = B64.decode(encoded_token).unwrap();
        let token_bytes: Vec<u8> = masked
            .iter()
            .zip(otp.iter().cycle())
            .map(|(m, o)| m ^ o)
            .collect();
        let token = String::from_utf8(token_bytes).unwrap();

        // The decoded token is a live root token.
        core.handle_request(write_secret(
            "secret/data/via-generated-root",
            &token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn only_one_generate_root_at_a_time() {
        let (core, _, _) = initialized_core().await;
        core.generate_root_init().await.unwrap();
        let err = core.generate_root_init().await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        core.generate_root_cancel().await;
        core.generate_root_init().await.unwrap();
    }

    // ── Rekey through the core ───────────────────────────────────────

    #[tokio::test]
    async fn rekey_split_only_produces_usable_shares() {
        let (core, init, _) = initialized_core().await;
        core.handle_request(write_secret(
            "secret/data/before-rekey",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        let status = core
            .rekey()
            .init(
                RekeyConfig {
                    secret_shares: 3,
                    secret_threshold: 2,
                    mode: RekeyMode::SplitOnly,
                    target: RekeyTarget::Barrier,
                },
                core.migration_active(),
            )
            .await
            .unwrap();

        let mut new_shares = None;
        for share in init.key_shares.iter().take(3) {
            match core
                .rekey()
                .submit(&status.nonce, decode_share(share))
                .await
                .unwrap()
            {
                RekeyOutcome::InProgress(_) => {}
                RekeyOutcome::Complete { new_shares: shares } => {
                    new_shares = Some(shares);
                }
            }
        }
        let new_shares = new_shares.expect("rekey did not complete");
        assert_eq!(new_shares.len(), 3);

        // Old data opens under the new shares after a seal cycle.
        core.seal_core().await.unwrap();
        for share in new_shares.iter().take(2) {
            let _ = core.submit_unseal_share(share.clone()).await.unwrap();
        }
        assert_eq!(core.state().await, CoreState::Active);
        let response = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/before-rekey")
                    .with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], 1);
    }

    // ── Keyring rotation ─────────────────────────────────────────────

    #[tokio::test]
    async fn rotation_keeps_old_secrets_readable() {
        let (core, init, _) = initialized_core().await;
        core.handle_request(write_secret(
            "secret/data/old-term",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        let term = core.rotate_barrier().await.unwrap();
        assert_eq!(term, 2);

        let response = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/old-term")
                    .with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], 1);
    }

    // ── Audit fail-closed ────────────────────────────────────────────

    struct StuckSink;

    #[async_trait::async_trait]
    impl AuditSink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }

        fn blocking(&self) -> bool {
            true
        }

        async fn log(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::SinkFailure {
                name: "stuck".to_owned(),
                reason: "socket wedged".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn stuck_blocking_sink_fails_requests() {
        let (core, init, _) = initialized_core().await;
        core.audit()
            .add_sink(Arc::new(MemorySink::new()) as Arc<dyn AuditSink>)
            .await;
        core.audit().add_sink(Arc::new(StuckSink)).await;

        let err = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/x").with_token(&init.root_token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal { .. }));
    }

    #[tokio::test]
    async fn successful_requests_are_audited() {
        let (core, init, _) = initialized_core().await;
        let sink = Arc::new(MemorySink::new());
        core.audit()
            .add_sink(Arc::clone(&sink) as Arc<dyn AuditSink>)
            .await;

        core.handle_request(write_secret(
            "secret/data/audited",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "secret/data/audited");
        assert_eq!(entries[0].outcome, "success");
        assert!(entries[0].token_hmac.starts_with("hmac-sha256:"));
    }

    // ── Mount lifecycle through the core ─────────────────────────────

    #[tokio::test]
    async fn mount_write_unmount_revokes_routing() {
        let (core, init, _) = initialized_core().await;
        core.mount_engine(MountEntry::new("team-a/", "kv")).await.unwrap();

        core.handle_request(write_secret(
            "team-a/data/x",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        core.unmount_engine("team-a/").await.unwrap();
        let err = core
            .handle_request(
                Request::new(Operation::Read, "team-a/data/x").with_token(&init.root_token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remount_preserves_data() {
        let (core, init, _) = initialized_core().await;
        core.mount_engine(MountEntry::new("before/", "kv")).await.unwrap();
        core.handle_request(write_secret(
            "before/data/x",
            &init.root_token,
            serde_json::json!({"v": "kept"}),
        ))
        .await
        .unwrap();

        core.remount_engine("before/", "after/").await.unwrap();
        let response = core
            .handle_request(
                Request::new(Operation::Read, "after/data/x").with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], "kept");
    }

    #[tokio::test]
    async fn unknown_engine_type_rejected() {
        let (core, _, _) = initialized_core().await;
        let err = core
            .mount_engine(MountEntry::new("x/", "no-such-engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    // ── Seal migration ───────────────────────────────────────────────

    #[tokio::test]
    async fn migrate_to_external_seal_then_auto_unseal() {
        let (core, init, _) = initialized_core().await;
        core.handle_request(write_secret(
            "secret/data/migrated",
            &init.root_token,
            serde_json::json!({"v": 1}),
        ))
        .await
        .unwrap();

        let wrapper = Arc::new(AeadKeyWrapper::new(EncryptionKey::generate(), "kms-new"));
        let new_seal = Arc::new(crate::seal::ExternalSeal::new(wrapper));
        let shares: Vec<Vec<u8>> = init.key_shares.iter().take(3).map(|s| decode_share(s)).collect();
        core.migrate_seal(new_seal, shares).await.unwrap();

        core.seal_core().await.unwrap();
        core.auto_unseal().await.unwrap();
        let response = core
            .handle_request(
                Request::new(Operation::Read, "secret/data/migrated")
                    .with_token(&init.root_token),
            )
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], 1);
    }
}
