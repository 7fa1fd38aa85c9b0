//! High-availability leadership through a storage lock.
//!
//! One record at a reserved physical path names the active node, its
//! advertised API address, and a heartbeat expiry. Standbys poll for the
//! lock; the active node renews it; step-down deletes it. The record lives
//! in cleartext physical storage so a standby can answer "who is the
//! leader" even while sealed.
//!
//! The acquire path is write-then-read-back: after writing its own claim a
//! node re-reads the record and only considers itself leader if its claim
//! survived. A replicated backend serializes the writes through the log,
//! which is what makes the read-back decisive; on a plain local backend
//! the lock is only advisory (there is nothing to race against).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use citadel_storage::{StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Cleartext record naming the lock holder.
pub const LOCK_PATH: &str = "core/lock";

/// The persisted lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub api_addr: String,
    pub expires: DateTime<Utc>,
}

impl LockRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// The storage lock.
pub struct HaLock {
    storage: Arc<dyn StorageBackend>,
    node_id: String,
    api_addr: String,
    ttl_secs: i64,
}

impl std::fmt::Debug for HaLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaLock")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl HaLock {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        node_id: impl Into<String>,
        api_addr: impl Into<String>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            storage,
            node_id: node_id.into(),
            api_addr: api_addr.into(),
            ttl_secs,
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Attempt to take the lock. Returns whether this node now holds it.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn try_acquire(&self) -> Result<bool, StorageError> {
        let now = Utc::now();
        if let Some(current) = self.read().await? {
            if current.is_live(now) && current.holder != self.node_id {
                return Ok(false);
            }
        }

        self.write_claim(now).await?;

        // Read back: our claim must have survived any concurrent writer.
        match self.read().await? {
            Some(record) if record.holder == self.node_id => {
                info!(node_id = %self.node_id, "ha lock acquired");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Refresh the heartbeat. Only effective while this node holds the
    /// lock; returns whether it still does.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn renew(&self) -> Result<bool, StorageError> {
        match self.read().await? {
            Some(record) if record.holder == self.node_id => {
                self.write_claim(Utc::now()).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Voluntarily release the lock (step-down). A no-op when another node
    /// holds it.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn release(&self) -> Result<(), StorageError> {
        if let Some(record) = self.read().await? {
            if record.holder == self.node_id {
                self.storage.delete(LOCK_PATH).await?;
                info!(node_id = %self.node_id, "ha lock released");
            }
        }
        Ok(())
    }

    /// The current live leader, if any.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn leader(&self) -> Result<Option<LockRecord>, StorageError> {
        Ok(self.read().await?.filter(|r| r.is_live(Utc::now())))
    }

    async fn read(&self) -> Result<Option<LockRecord>, StorageError> {
        let Some(raw) = self.storage.get(LOCK_PATH).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&raw).ok())
    }

    async fn write_claim(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let record = LockRecord {
            holder: self.node_id.clone(),
            api_addr: self.api_addr.clone(),
            expires: now + Duration::seconds(self.ttl_secs),
        };
        let raw = serde_json::to_vec(&record).map_err(|e| StorageError::Write {
            key: LOCK_PATH.to_owned(),
            reason: format!("lock record encoding failed: {e}"),
        })?;
        self.storage.put(LOCK_PATH, &raw).await
    }
}
