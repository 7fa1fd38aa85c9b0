//! Minimal identity store: entities and their auth aliases.
//!
//! An entity is a persistent identity that can be reached through multiple
//! auth aliases (one per auth mount). Tokens carry an `entity_id`; policy
//! templates expand entity attributes at evaluation time. Cross-references
//! are by identifier only — tokens store the entity id and look it up here,
//! never a back-pointer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::IdentityError;

/// Storage prefix for entity records.
const ENTITY_PREFIX: &str = "sys/identity/entity/";

/// One auth alias binding an entity to a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAlias {
    /// Accessor of the auth mount the alias belongs to.
    pub mount_accessor: String,
    /// The alias's name at that mount (e.g. a username).
    pub name: String,
}

/// A persistent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<EntityAlias>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Policies attached directly to the entity, unioned with token
    /// policies at evaluation time.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Persists and resolves entities.
pub struct IdentityStore {
    barrier: Arc<Barrier>,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").finish_non_exhaustive()
    }
}

impl IdentityStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create an entity. A fresh id is allocated when `name` only is given.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn create(
        &self,
        name: impl Into<String>,
        aliases: Vec<EntityAlias>,
        metadata: HashMap<String, String>,
        policies: Vec<String>,
    ) -> Result<Entity, IdentityError> {
        let entity = Entity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            aliases,
            metadata,
            policies,
        };
        self.persist(&entity).await?;
        info!(entity_id = %entity.id, name = %entity.name, "entity created");
        Ok(entity)
    }

    /// Fetch an entity by id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] when absent.
    pub async fn get(&self, id: &str) -> Result<Entity, IdentityError> {
        let key = format!("{ENTITY_PREFIX}{id}");
        let raw = self
            .barrier
            .get(&key)
            .await?
            .ok_or_else(|| IdentityError::NotFound { id: id.to_owned() })?;
        serde_json::from_slice(&raw).map_err(|_| IdentityError::NotFound { id: id.to_owned() })
    }

    /// Update an entity in place.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn persist(&self, entity: &Entity) -> Result<(), IdentityError> {
        let key = format!("{ENTITY_PREFIX}{}", entity.id);
        let raw = serde_json::to_vec(entity).map_err(|e| {
            IdentityError::Barrier(crate::error::BarrierError::Serialization {
                reason: format!("entity encoding failed: {e}"),
            })
        })?;
        self.barrier.put(&key, &raw).await?;
        Ok(())
    }

    /// Delete an entity by id. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn delete(&self, id: &str) -> Result<(), IdentityError> {
        let key = format!("{ENTITY_PREFIX}{id}");
        self.barrier.delete(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use citadel_storage::MemoryBackend;

    async fn make_store() -> IdentityStore {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.initialize(EncryptionKey::generate()).await.unwrap();
        IdentityStore::new(barrier)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = make_store().await;
        let entity = store
            .create(
                "service-a",
                vec![EntityAlias {
                    mount_accessor: "auth_token_1".to_owned(),
                    name: "svc-a".to_owned(),
                }],
                HashMap::new(),
                vec!["default".to_owned()],
            )
            .await
            .unwrap();

        let fetched = store.get(&entity.id).await.unwrap();
        assert_eq!(fetched.name, "service-a");
        assert_eq!(fetched.aliases.len(), 1);
        assert_eq!(fetched.policies, vec!["default".to_owned()]);
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let store = make_store().await;
        assert!(matches!(
            store.get("no-such-entity").await,
            Err(IdentityError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_entity() {
        let store = make_store().await;
        let entity = store
            .create("temp", Vec::new(), HashMap::new(), Vec::new())
            .await
            .unwrap();
        store.delete(&entity.id).await.unwrap();
        assert!(matches!(
            store.get(&entity.id).await,
            Err(IdentityError::NotFound { .. })
        ));
    }
}
