//! The expiration manager: lease tracking, renewal, and revocation.
//!
//! Every credential with a TTL gets a lease: auth leases for tokens, secret
//! leases for engine-returned secrets. Lease records persist under
//! `sys/expire/id/<sha256(lease_id)>`; an in-memory priority queue keyed on
//! expire time drives the background revocation loop. The queue mutex is
//! held only for pop/insert — never across a revoker callback.
//!
//! Delivery is at-least-once: the queue is rebuilt from persisted records
//! on unseal, so a crash mid-revocation re-queues the lease. Failed
//! revocations retry with exponential backoff up to a cap, then the lease
//! is parked as irrevocable and retried by a periodic sweep.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::error::{LeaseError, LogicalError};

/// Storage prefix for lease records.
const LEASE_PREFIX: &str = "sys/expire/id/";

/// Storage prefix for the token→lease index.
const TOKEN_INDEX_PREFIX: &str = "sys/expire/token-index/";

/// Revocation attempts before a lease is parked as irrevocable.
const MAX_REVOKE_ATTEMPTS: u32 = 6;

/// Backoff ceiling between revocation retries.
const MAX_BACKOFF_SECS: i64 = 600;

/// How many ticks pass between irrevocable sweeps.
const SWEEP_EVERY_TICKS: u64 = 10;

/// A tracked lease. Exactly one of `secret_data` / `auth_data` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub lease_id: String,
    /// Hash of the token the lease was issued to.
    pub client_token_hash: String,
    /// The request path that produced the lease; revocation routes here.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_data: Option<serde_json::Value>,
    pub issue_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub last_renewal: Option<DateTime<Utc>>,
    #[serde(default)]
    pub namespace: String,
    pub renewable: bool,
    /// Ceiling on renewals, measured from issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl_secs: Option<i64>,
    #[serde(default)]
    pub revoke_attempts: u32,
    #[serde(default)]
    pub irrevocable: bool,
}

impl LeaseEntry {
    /// Remaining TTL in seconds, never negative.
    #[must_use]
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expire_time - now).num_seconds().max(0)
    }

    /// Whether this is an auth (token) lease.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        self.auth_data.is_some()
    }
}

/// Parameters for registering a lease.
#[derive(Debug)]
pub struct RegisterLease {
    pub client_token_hash: String,
    pub path: String,
    /// Engine-private data needed at revocation time.
    pub secret_data: Option<serde_json::Value>,
    pub auth_data: Option<serde_json::Value>,
    pub ttl_secs: i64,
    pub max_ttl_secs: Option<i64>,
    pub renewable: bool,
    pub namespace: String,
}

/// The thing that actually revokes a lease (router dispatch to the issuing
/// engine, or the token store for auth leases). Injected after
/// construction to keep the reference graph acyclic.
#[async_trait::async_trait]
pub trait LeaseRevoker: Send + Sync {
    /// Revoke whatever the lease protects.
    ///
    /// # Errors
    ///
    /// Returns a [`LogicalError`] when the engine-side revocation fails;
    /// the manager will retry with backoff.
    async fn revoke(&self, lease: &LeaseEntry) -> Result<(), LogicalError>;
}

#[derive(Debug, PartialEq, Eq)]
struct QueueItem {
    at: DateTime<Utc>,
    lease_id: String,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.lease_id.cmp(&other.lease_id))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome counters for one revocation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub revoked: u32,
    pub retried: u32,
    pub parked_irrevocable: u32,
}

/// Tracks leases and drives revocation.
pub struct ExpirationManager {
    barrier: Arc<Barrier>,
    queue: parking_lot::Mutex<BinaryHeap<Reverse<QueueItem>>>,
    revoker: RwLock<Option<Arc<dyn LeaseRevoker>>>,
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager")
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

fn lease_key(lease_id: &str) -> String {
    format!("{LEASE_PREFIX}{}", hex::encode(Sha256::digest(lease_id)))
}

fn token_index_key(token_hash: &str, lease_id: &str) -> String {
    format!(
        "{TOKEN_INDEX_PREFIX}{token_hash}/{}",
        hex::encode(Sha256::digest(lease_id))
    )
}

impl ExpirationManager {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            queue: parking_lot::Mutex::new(BinaryHeap::new()),
            revoker: RwLock::new(None),
        }
    }

    /// Install the revoker. Must happen before the background loop runs.
    pub async fn set_revoker(&self, revoker: Arc<dyn LeaseRevoker>) {
        *self.revoker.write().await = Some(revoker);
    }

    /// Register a lease and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on persistence failure, or an
    /// invalid-registration error if neither or both data kinds are given.
    pub async fn register(&self, params: RegisterLease) -> Result<LeaseEntry, LeaseError> {
        if params.secret_data.is_some() == params.auth_data.is_some() {
            return Err(LeaseError::Barrier(
                crate::error::BarrierError::Serialization {
                    reason: "exactly one of secret_data or auth_data must be present".to_owned(),
                },
            ));
        }

        let now = Utc::now();
        let lease_id = format!("{}/{}", params.path.trim_end_matches('/'), uuid::Uuid::new_v4());
        let entry = LeaseEntry {
            lease_id: lease_id.clone(),
            client_token_hash: params.client_token_hash.clone(),
            path: params.path,
            secret_data: params.secret_data,
            auth_data: params.auth_data,
            issue_time: now,
            expire_time: now + Duration::seconds(params.ttl_secs),
            last_renewal: None,
            namespace: params.namespace,
            renewable: params.renewable,
            max_ttl_secs: params.max_ttl_secs,
            revoke_attempts: 0,
            irrevocable: false,
        };

        self.persist(&entry).await?;
        self.barrier
            .put(
                &token_index_key(&params.client_token_hash, &lease_id),
                lease_id.as_bytes(),
            )
            .await?;

        self.push(entry.expire_time, &lease_id);
        info!(lease_id = %lease_id, ttl = params.ttl_secs, "lease registered");
        Ok(entry)
    }

    /// Look up a lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotFound`] when absent.
    pub async fn lookup(&self, lease_id: &str) -> Result<LeaseEntry, LeaseError> {
        let raw = self
            .barrier
            .get(&lease_key(lease_id))
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })?;
        serde_json::from_slice(&raw).map_err(|_| LeaseError::NotFound {
            lease_id: lease_id.to_owned(),
        })
    }

    /// Renew a lease.
    ///
    /// The new expiry is `now + increment`, clamped to the lease's max TTL
    /// ceiling; it never moves backwards, so `expire_time` is monotonic
    /// across successful renewals.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] when absent.
    /// - [`LeaseError::NotRenewable`] when the lease forbids renewal.
    pub async fn renew(
        &self,
        lease_id: &str,
        increment_secs: i64,
    ) -> Result<LeaseEntry, LeaseError> {
        let mut entry = self.lookup(lease_id).await?;
        if !entry.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }

        let now = Utc::now();
        let mut new_expiry = now + Duration::seconds(increment_secs);
        if let Some(max) = entry.max_ttl_secs {
            let ceiling = entry.issue_time + Duration::seconds(max);
            if new_expiry > ceiling {
                new_expiry = ceiling;
            }
        }
        if new_expiry < entry.expire_time {
            new_expiry = entry.expire_time;
        }

        entry.expire_time = new_expiry;
        entry.last_renewal = Some(now);
        self.persist(&entry).await?;
        self.push(entry.expire_time, lease_id);

        info!(lease_id = %lease_id, "lease renewed");
        Ok(entry)
    }

    /// Revoke one lease.
    ///
    /// With `force`, the record is removed without contacting the engine —
    /// any data-source side effects are orphaned, which the operator
    /// explicitly accepts.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] when absent.
    /// - Engine failures are surfaced as [`LeaseError::Irrevocable`] only
    ///   after retries exhaust; a direct call maps them to `NotRenewable`
    ///   style barrier errors via the background path instead.
    pub async fn revoke(&self, lease_id: &str, force: bool) -> Result<(), LeaseError> {
        let entry = self.lookup(lease_id).await?;

        if !force {
            let revoker = self.revoker.read().await;
            if let Some(revoker) = revoker.as_ref() {
                revoker.revoke(&entry).await.map_err(|e| {
                    warn!(lease_id = %lease_id, error = %e, "revoker failed");
                    LeaseError::Irrevocable {
                        lease_id: lease_id.to_owned(),
                    }
                })?;
            }
        }

        self.remove_record(&entry).await?;
        info!(lease_id = %lease_id, force, "lease revoked");
        Ok(())
    }

    /// Revoke every lease issued to a token. Used by token revocation.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures; individual engine failures leave the
    /// lease queued for retry.
    pub async fn revoke_by_token(&self, token_hash: &str) -> Result<u32, LeaseError> {
        let prefix = format!("{TOKEN_INDEX_PREFIX}{token_hash}/");
        let keys = self.barrier.list(&prefix).await?;
        let mut revoked = 0u32;
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let lease_id = String::from_utf8_lossy(&raw).into_owned();
            match self.revoke(&lease_id, false).await {
                Ok(()) => revoked += 1,
                Err(LeaseError::NotFound { .. }) => {
                    self.barrier.delete(key).await?;
                }
                Err(e) => {
                    warn!(lease_id = %lease_id, error = %e, "token lease revocation deferred");
                    // Leave it for the background loop.
                    self.push(Utc::now(), &lease_id);
                }
            }
        }
        Ok(revoked)
    }

    /// All leases currently issued to a token.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn leases_for_token(&self, token_hash: &str) -> Result<Vec<LeaseEntry>, LeaseError> {
        let prefix = format!("{TOKEN_INDEX_PREFIX}{token_hash}/");
        let keys = self.barrier.list(&prefix).await?;
        let mut leases = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let lease_id = String::from_utf8_lossy(&raw).into_owned();
            if let Ok(entry) = self.lookup(&lease_id).await {
                leases.push(entry);
            }
        }
        Ok(leases)
    }

    /// Revoke every lease whose request path falls under `prefix`.
    /// Used when a mount is removed.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn revoke_prefix(&self, prefix: &str, force: bool) -> Result<u32, LeaseError> {
        let keys = self.barrier.list(LEASE_PREFIX).await?;
        let mut revoked = 0u32;
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<LeaseEntry>(&raw) else {
                continue;
            };
            if entry.path.starts_with(prefix) {
                match self.revoke(&entry.lease_id, force).await {
                    Ok(()) => revoked += 1,
                    Err(e) => {
                        warn!(lease_id = %entry.lease_id, error = %e, "prefix revocation deferred");
                        self.push(Utc::now(), &entry.lease_id);
                    }
                }
            }
        }
        info!(prefix = %prefix, revoked, "prefix revocation complete");
        Ok(revoked)
    }

    /// Rewrite lease paths under a remount. `old` and `new` are mount
    /// prefixes ending in `/`.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn rewrite_prefix(&self, old: &str, new: &str) -> Result<u32, LeaseError> {
        let keys = self.barrier.list(LEASE_PREFIX).await?;
        let mut rewritten = 0u32;
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let Ok(mut entry) = serde_json::from_slice::<LeaseEntry>(&raw) else {
                continue;
            };
            if let Some(rest) = entry.path.strip_prefix(old) {
                entry.path = format!("{new}{rest}");
                let rest_id = entry
                    .lease_id
                    .strip_prefix(old)
                    .map(|r| format!("{new}{r}"));
                // Lease ids embed the path; keep them aligned.
                if let Some(new_id) = rest_id {
                    self.barrier.delete(key).await?;
                    self.barrier
                        .delete(&token_index_key(&entry.client_token_hash, &entry.lease_id))
                        .await?;
                    entry.lease_id = new_id;
                    self.persist(&entry).await?;
                    self.barrier
                        .put(
                            &token_index_key(&entry.client_token_hash, &entry.lease_id),
                            entry.lease_id.as_bytes(),
                        )
                        .await?;
                    self.push(entry.expire_time, &entry.lease_id);
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }

    /// Rebuild the in-memory queue from persisted records. Called on
    /// unseal; gives at-least-once delivery across crashes.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn restore(&self) -> Result<u32, LeaseError> {
        let keys = self.barrier.list(LEASE_PREFIX).await?;
        let mut restored = 0u32;
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<LeaseEntry>(&raw) else {
                warn!(key = %key, "undecodable lease record skipped during restore");
                continue;
            };
            if !entry.irrevocable {
                self.push(entry.expire_time, &entry.lease_id);
                restored += 1;
            }
        }
        info!(restored, "expiration queue restored");
        Ok(restored)
    }

    /// One revocation pass: pop everything due and revoke it.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures; engine failures are retried, not
    /// returned.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, LeaseError> {
        let mut stats = TickStats::default();

        loop {
            // Hold the queue mutex only for the pop.
            let lease_id = {
                let mut queue = self.queue.lock();
                let due = matches!(queue.peek(), Some(Reverse(item)) if item.at <= now);
                if !due {
                    break;
                }
                match queue.pop() {
                    Some(Reverse(item)) => item.lease_id,
                    None => break,
                }
            };

            let entry = match self.lookup(&lease_id).await {
                Ok(entry) => entry,
                // Already revoked through another path; queue entry stale.
                Err(LeaseError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            if entry.expire_time > now {
                // Renewed since this queue item was pushed.
                self.push(entry.expire_time, &lease_id);
                continue;
            }
            if entry.irrevocable {
                continue;
            }

            match self.revoke(&lease_id, false).await {
                Ok(()) => stats.revoked += 1,
                Err(_) => {
                    let mut entry = match self.lookup(&lease_id).await {
                        Ok(entry) => entry,
                        Err(_) => continue,
                    };
                    entry.revoke_attempts += 1;
                    if entry.revoke_attempts >= MAX_REVOKE_ATTEMPTS {
                        entry.irrevocable = true;
                        self.persist(&entry).await?;
                        stats.parked_irrevocable += 1;
                        warn!(lease_id = %lease_id, "lease parked as irrevocable");
                    } else {
                        let backoff =
                            (1i64 << entry.revoke_attempts).min(MAX_BACKOFF_SECS);
                        self.persist(&entry).await?;
                        self.push(now + Duration::seconds(backoff), &lease_id);
                        stats.retried += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Re-queue irrevocable leases for another attempt.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn sweep_irrevocable(&self) -> Result<u32, LeaseError> {
        let keys = self.barrier.list(LEASE_PREFIX).await?;
        let mut requeued = 0u32;
        for key in &keys {
            let Some(raw) = self.barrier.get(key).await? else {
                continue;
            };
            let Ok(mut entry) = serde_json::from_slice::<LeaseEntry>(&raw) else {
                continue;
            };
            if entry.irrevocable {
                entry.irrevocable = false;
                entry.revoke_attempts = 0;
                self.persist(&entry).await?;
                self.push(Utc::now(), &entry.lease_id);
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!(requeued, "irrevocable leases requeued by sweep");
        }
        Ok(requeued)
    }

    /// Background loop: tick on an interval, sweep occasionally, honor the
    /// shutdown signal.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        interval_secs: u64,
    ) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        let mut ticks: u64 = 0;
        info!(interval_secs, "expiration loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    match self.tick(Utc::now()).await {
                        Ok(stats) if stats != TickStats::default() => {
                            info!(
                                revoked = stats.revoked,
                                retried = stats.retried,
                                parked = stats.parked_irrevocable,
                                "expiration tick complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "expiration tick failed"),
                    }
                    if ticks % SWEEP_EVERY_TICKS == 0 {
                        if let Err(e) = self.sweep_irrevocable().await {
                            warn!(error = %e, "irrevocable sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("expiration loop shutting down");
                    return;
                }
            }
        }
    }

    fn push(&self, at: DateTime<Utc>, lease_id: &str) {
        self.queue.lock().push(Reverse(QueueItem {
            at,
            lease_id: lease_id.to_owned(),
        }));
    }

    async fn persist(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        let raw = serde_json::to_vec(entry).map_err(|e| {
            LeaseError::Barrier(crate::error::BarrierError::Serialization {
                reason: format!("lease encoding failed: {e}"),
            })
        })?;
        self.barrier.put(&lease_key(&entry.lease_id), &raw).await?;
        Ok(())
    }

    async fn remove_record(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        self.barrier.delete(&lease_key(&entry.lease_id)).await?;
        self.barrier
            .delete(&token_index_key(&entry.client_token_hash, &entry.lease_id))
            .await?;
        Ok(())
    }
}
