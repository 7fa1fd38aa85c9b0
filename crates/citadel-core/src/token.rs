//! The token store.
//!
//! Two token kinds exist. **Service tokens** (`s.` prefix) are persisted:
//! the token is hashed with SHA-256 before storage, indexed by an opaque
//! accessor, and arranged in a parent/child hierarchy so revoking a parent
//! cascades to its non-orphan children. **Batch tokens** (`b.` prefix) are
//! self-describing blobs encrypted by the barrier's active data key — never
//! persisted, never renewable, verified purely cryptographically.
//!
//! Root tokens are service tokens carrying the `root` policy with no
//! expiry. They are only created at initialization or through the
//! generate-root ceremony.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::barrier::Barrier;
use crate::error::TokenError;

/// Storage prefix for token entries, keyed by SHA-256 of the token id.
const TOKEN_ID_PREFIX: &str = "sys/token/id/";

/// Storage prefix for the accessor index.
const ACCESSOR_PREFIX: &str = "sys/token/accessor/";

/// Storage prefix for the parent→child index.
const PARENT_PREFIX: &str = "sys/token/parent/";

/// AAD context for batch-token envelopes.
const BATCH_TOKEN_CONTEXT: &str = "auth/token/batch";

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Service,
    Batch,
}

/// A stored (or reconstructed) token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// SHA-256 of the token id, hex. Also the storage key suffix.
    pub id_hash: String,
    /// Opaque identifier safe for audit logs and policies.
    pub accessor: String,
    /// Parent token hash; `None` for root and orphan tokens.
    pub parent_hash: Option<String>,
    pub policies: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub creation_time: DateTime<Utc>,
    /// Absolute expiry; `None` = never (root tokens only).
    pub expires_at: Option<DateTime<Utc>>,
    pub last_renewal: Option<DateTime<Utc>>,
    /// Hard ceiling on renewals, measured from creation.
    pub explicit_max_ttl: Option<i64>,
    pub entity_id: Option<String>,
    pub token_type: TokenType,
    pub orphan: bool,
    /// Periodic tokens renew to `now + period` indefinitely.
    pub period: Option<i64>,
    #[serde(default)]
    pub bound_cidrs: Vec<String>,
    pub display_name: String,
}

impl TokenEntry {
    /// Whether this token has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Remaining TTL in seconds (0 when expired or infinite).
    #[must_use]
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> i64 {
        self.expires_at
            .map_or(0, |at| (at - now).num_seconds().max(0))
    }
}

/// Parameters for creating a service token.
#[derive(Debug, Default)]
pub struct CreateTokenParams {
    pub policies: Vec<String>,
    pub ttl_secs: Option<i64>,
    pub explicit_max_ttl: Option<i64>,
    pub period: Option<i64>,
    pub parent_hash: Option<String>,
    pub orphan: bool,
    pub entity_id: Option<String>,
    pub meta: HashMap<String, String>,
    pub bound_cidrs: Vec<String>,
    pub display_name: String,
}

/// Self-contained payload of a batch token.
#[derive(Debug, Serialize, Deserialize)]
struct BatchPayload {
    policies: Vec<String>,
    entity_id: Option<String>,
    creation_time: DateTime<Utc>,
    ttl_secs: i64,
    orphan: bool,
    display_name: String,
}

/// Record stored in the accessor index.
#[derive(Serialize, Deserialize)]
struct AccessorIndex {
    id_hash: String,
}

/// Issues, looks up, renews, and revokes tokens.
pub struct TokenStore {
    barrier: Arc<Barrier>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

/// SHA-256 of a token string, hex encoded.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn random_token_id(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}{}", B64URL.encode(bytes))
}

impl TokenStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create a service token. Returns the plaintext token (shown once)
    /// and its stored entry.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn create(
        &self,
        params: CreateTokenParams,
    ) -> Result<(String, TokenEntry), TokenError> {
        let token = random_token_id("s.");
        let id_hash = hash_token(&token);
        let accessor = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let effective_ttl = match (params.ttl_secs, params.explicit_max_ttl) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (Some(ttl), None) => Some(ttl),
            (None, Some(max)) => Some(max),
            (None, None) => None,
        };

        let entry = TokenEntry {
            id_hash: id_hash.clone(),
            accessor: accessor.clone(),
            parent_hash: if params.orphan {
                None
            } else {
                params.parent_hash.clone()
            },
            policies: params.policies,
            meta: params.meta,
            creation_time: now,
            expires_at: effective_ttl.map(|ttl| now + Duration::seconds(ttl)),
            last_renewal: None,
            explicit_max_ttl: params.explicit_max_ttl,
            entity_id: params.entity_id,
            token_type: TokenType::Service,
            orphan: params.orphan,
            period: params.period,
            bound_cidrs: params.bound_cidrs,
            display_name: params.display_name,
        };

        self.persist(&entry).await?;

        // Accessor index.
        let accessor_key = format!("{ACCESSOR_PREFIX}{}", hash_token(&accessor));
        let index = serde_json::to_vec(&AccessorIndex {
            id_hash: id_hash.clone(),
        })
        .map_err(|e| {
            TokenError::Barrier(crate::error::BarrierError::Serialization {
                reason: format!("accessor index encoding failed: {e}"),
            })
        })?;
        self.barrier.put(&accessor_key, &index).await?;

        // Parent→child index, unless orphaned.
        if let (Some(parent), false) = (&params.parent_hash, params.orphan) {
            let child_key = format!("{PARENT_PREFIX}{parent}/{id_hash}");
            self.barrier.put(&child_key, b"1").await?;
        }

        info!(display_name = %entry.display_name, accessor = %accessor, "service token created");
        Ok((token, entry))
    }

    /// Create the root token. No expiry, `root` policy, no parent.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn create_root(&self) -> Result<(String, TokenEntry), TokenError> {
        self.create(CreateTokenParams {
            policies: vec!["root".to_owned()],
            display_name: "root".to_owned(),
            orphan: true,
            ..CreateTokenParams::default()
        })
        .await
    }

    /// Create a batch token: encrypted, self-describing, never persisted.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures (the active data key encrypts the blob).
    pub async fn create_batch(
        &self,
        policies: Vec<String>,
        ttl_secs: i64,
        entity_id: Option<String>,
        display_name: String,
    ) -> Result<String, TokenError> {
        let payload = BatchPayload {
            policies,
            entity_id,
            creation_time: Utc::now(),
            ttl_secs,
            orphan: true,
            display_name,
        };
        let raw = serde_json::to_vec(&payload).map_err(|e| {
            TokenError::Barrier(crate::error::BarrierError::Serialization {
                reason: format!("batch payload encoding failed: {e}"),
            })
        })?;
        let blob = self
            .barrier
            .encrypt_tracked(BATCH_TOKEN_CONTEXT, &raw)
            .await?;
        Ok(format!("b.{}", B64URL.encode(blob)))
    }

    /// Resolve a token string to its entry, enforcing expiry.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] for unknown service tokens.
    /// - [`TokenError::Expired`] past the token's expiry.
    /// - [`TokenError::Malformed`] for undecodable batch tokens.
    pub async fn lookup(&self, token: &str) -> Result<TokenEntry, TokenError> {
        if let Some(encoded) = token.strip_prefix("b.") {
            return self.lookup_batch(encoded).await;
        }

        let id_hash = hash_token(token);
        let entry = self.load_by_hash(&id_hash).await?;

        // The storage hit already implies equality; keep the comparison
        // constant-time anyway so the code path never becomes a timing
        // oracle if the lookup strategy changes.
        let stored = entry.id_hash.as_bytes();
        let computed = id_hash.as_bytes();
        if stored.ct_eq(computed).unwrap_u8() != 1 {
            return Err(TokenError::NotFound);
        }

        let now = Utc::now();
        if entry.is_expired(now) {
            return Err(TokenError::Expired {
                expired_at: entry
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            });
        }
        Ok(entry)
    }

    async fn lookup_batch(&self, encoded: &str) -> Result<TokenEntry, TokenError> {
        let blob = B64URL.decode(encoded).map_err(|_| TokenError::Malformed)?;
        let raw = self
            .barrier
            .decrypt_tracked(BATCH_TOKEN_CONTEXT, &blob)
            .await
            .map_err(|_| TokenError::Malformed)?;
        let payload: BatchPayload =
            serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;

        let expires_at = payload.creation_time + Duration::seconds(payload.ttl_secs);
        if Utc::now() > expires_at {
            return Err(TokenError::Expired {
                expired_at: expires_at.to_rfc3339(),
            });
        }

        Ok(TokenEntry {
            id_hash: String::new(),
            accessor: String::new(),
            parent_hash: None,
            policies: payload.policies,
            meta: HashMap::new(),
            creation_time: payload.creation_time,
            expires_at: Some(expires_at),
            last_renewal: None,
            explicit_max_ttl: Some(payload.ttl_secs),
            entity_id: payload.entity_id,
            token_type: TokenType::Batch,
            orphan: payload.orphan,
            period: None,
            bound_cidrs: Vec::new(),
            display_name: payload.display_name,
        })
    }

    /// Resolve an accessor to its token entry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] when the accessor is unknown.
    pub async fn lookup_by_accessor(&self, accessor: &str) -> Result<TokenEntry, TokenError> {
        let key = format!("{ACCESSOR_PREFIX}{}", hash_token(accessor));
        let raw = self.barrier.get(&key).await?.ok_or(TokenError::NotFound)?;
        let index: AccessorIndex =
            serde_json::from_slice(&raw).map_err(|_| TokenError::NotFound)?;
        self.load_by_hash(&index.id_hash).await
    }

    /// Renew a service token.
    ///
    /// Periodic tokens renew to `now + period` regardless of the requested
    /// increment. Otherwise the new expiry is `now + increment`, clamped to
    /// `creation_time + explicit_max_ttl` when one is set.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotRenewable`] for batch tokens.
    /// - [`TokenError::MaxTtlExceeded`] at the explicit max TTL.
    pub async fn renew(
        &self,
        token: &str,
        increment_secs: i64,
    ) -> Result<TokenEntry, TokenError> {
        let mut entry = self.lookup(token).await?;
        if entry.token_type == TokenType::Batch {
            return Err(TokenError::NotRenewable);
        }

        let now = Utc::now();
        let mut new_expiry = match entry.period {
            Some(period) => now + Duration::seconds(period),
            None => now + Duration::seconds(increment_secs),
        };

        if let Some(max) = entry.explicit_max_ttl {
            let ceiling = entry.creation_time + Duration::seconds(max);
            if now >= ceiling {
                return Err(TokenError::MaxTtlExceeded);
            }
            if new_expiry > ceiling {
                new_expiry = ceiling;
            }
        }

        // Expiry never moves backwards through a renewal.
        if let Some(current) = entry.expires_at {
            if new_expiry < current {
                new_expiry = current;
            }
        }

        entry.expires_at = Some(new_expiry);
        entry.last_renewal = Some(now);
        self.persist(&entry).await?;
        Ok(entry)
    }

    /// Revoke a token and all its non-orphan descendants.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn revoke(&self, token: &str) -> Result<(), TokenError> {
        if token.starts_with("b.") {
            // Batch tokens have no stored state; they lapse on their own.
            return Ok(());
        }
        self.revoke_by_hash(&hash_token(token)).await
    }

    /// Revoke via the accessor index.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] for an unknown accessor.
    pub async fn revoke_by_accessor(&self, accessor: &str) -> Result<(), TokenError> {
        let entry = self.lookup_by_accessor(accessor).await?;
        self.revoke_by_hash(&entry.id_hash).await
    }

    /// Collect a token and all its non-orphan descendants, parents first.
    ///
    /// Used by the core to revoke the leases of an entire token tree
    /// before the stored entries are removed.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn subtree(&self, id_hash: &str) -> Result<Vec<TokenEntry>, TokenError> {
        let mut out = Vec::new();
        if let Ok(entry) = self.load_by_hash(id_hash).await {
            out.push(entry);
        }

        let children_prefix = format!("{PARENT_PREFIX}{id_hash}/");
        let children = self.barrier.list(&children_prefix).await?;
        for child_key in &children {
            if let Some(child_hash) = child_key.strip_prefix(&children_prefix) {
                let descendants = Box::pin(self.subtree(child_hash)).await?;
                out.extend(descendants);
            }
        }
        Ok(out)
    }

    /// Revoke a token subtree by its id hash.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn revoke_by_hash(&self, id_hash: &str) -> Result<(), TokenError> {
        // Children first, so a crash mid-revocation leaves orphan index
        // entries rather than live children of a dead parent.
        let children_prefix = format!("{PARENT_PREFIX}{id_hash}/");
        let children = self.barrier.list(&children_prefix).await?;
        for child_key in &children {
            if let Some(child_hash) = child_key.strip_prefix(&children_prefix) {
                Box::pin(self.revoke_by_hash(child_hash)).await?;
            }
            self.barrier.delete(child_key).await?;
        }

        if let Ok(entry) = self.load_by_hash(id_hash).await {
            let accessor_key = format!("{ACCESSOR_PREFIX}{}", hash_token(&entry.accessor));
            self.barrier.delete(&accessor_key).await?;
        }

        let key = format!("{TOKEN_ID_PREFIX}{id_hash}");
        self.barrier.delete(&key).await?;

        info!(
            token_hash_prefix = &id_hash[..8.min(id_hash.len())],
            "token revoked"
        );
        Ok(())
    }

    async fn load_by_hash(&self, id_hash: &str) -> Result<TokenEntry, TokenError> {
        let key = format!("{TOKEN_ID_PREFIX}{id_hash}");
        let raw = self.barrier.get(&key).await?.ok_or(TokenError::NotFound)?;
        serde_json::from_slice(&raw).map_err(|_| TokenError::NotFound)
    }

    async fn persist(&self, entry: &TokenEntry) -> Result<(), TokenError> {
        let key = format!("{TOKEN_ID_PREFIX}{}", entry.id_hash);
        let raw = serde_json::to_vec(entry).map_err(|e| {
            TokenError::Barrier(crate::error::BarrierError::Serialization {
                reason: format!("token encoding failed: {e}"),
            })
        })?;
        self.barrier.put(&key, &raw).await?;
        Ok(())
    }
}

/// Check whether an IPv4 address falls inside any of the bound CIDRs.
///
/// An empty CIDR list binds nothing (all sources allowed). Unparseable
/// CIDRs or addresses fail closed.
#[must_use]
pub fn cidr_match(bound_cidrs: &[String], addr: &str) -> bool {
    if bound_cidrs.is_empty() {
        return true;
    }
    let Ok(ip) = addr.parse::<std::net::Ipv4Addr>() else {
        return false;
    };
    let ip_bits = u32::from(ip);

    bound_cidrs.iter().any(|cidr| {
        let Some((net, len)) = cidr.split_once('/') else {
            return false;
        };
        let (Ok(net), Ok(len)) = (net.parse::<std::net::Ipv4Addr>(), len.parse::<u32>()) else {
            return false;
        };
        if len > 32 {
            return false;
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        (ip_bits & mask) == (u32::from(net) & mask)
    })
}
