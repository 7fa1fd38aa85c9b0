//! The persisted mount tables.
//!
//! Two tables exist: secret engines and auth methods. Each mount is stored
//! as its own record (`core/mounts/<uuid>`, `core/auth/<uuid>`) so a large
//! mount count never collides with the entry-size limit; a small index
//! record lists the live UUIDs for fast enumeration.
//!
//! Writes order the records before the index: on add, the entry record
//! lands first and the index last; on remove, the index shrinks first and
//! the record is deleted after. A concurrent reader loading index-then-
//! records therefore always observes either the old or the new complete
//! mount set — never a half-written one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::barrier::Barrier;
use crate::error::MountError;

/// Record prefix for secret-engine mounts.
const SECRET_RECORD_PREFIX: &str = "core/mounts/";

/// Record prefix for auth-method mounts.
const AUTH_RECORD_PREFIX: &str = "core/auth/";

/// Index records, written last.
const SECRET_INDEX_KEY: &str = "core/mounts-index";
const AUTH_INDEX_KEY: &str = "core/auth-index";

/// Mount paths that user mounts may never collide with.
pub const PROTECTED_PREFIXES: &[&str] = &["sys/", "auth/token/", "cubbyhole/", "identity/"];

/// Which table a mount belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountTableType {
    Secret,
    Auth,
}

impl MountTableType {
    fn record_prefix(self) -> &'static str {
        match self {
            Self::Secret => SECRET_RECORD_PREFIX,
            Self::Auth => AUTH_RECORD_PREFIX,
        }
    }

    fn index_key(self) -> &'static str {
        match self {
            Self::Secret => SECRET_INDEX_KEY,
            Self::Auth => AUTH_INDEX_KEY,
        }
    }
}

/// Tunable per-mount configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_lease_ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lease_ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, String>,
}

/// One mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    pub uuid: String,
    /// Routing prefix, always ending in `/`. Auth mounts carry their full
    /// routed path (`auth/<name>/`).
    pub path: String,
    /// Engine type name, resolved through the registry.
    pub entry_type: String,
    /// Opaque identifier used in audit logs and identity aliases.
    pub accessor: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: MountConfig,
    /// Local mounts are not replicated to performance secondaries.
    #[serde(default)]
    pub local: bool,
    /// Whether this mount's storage is additionally seal-wrapped.
    #[serde(default)]
    pub seal_wrap: bool,
    /// Whether the engine may draw from the external entropy source.
    #[serde(default)]
    pub external_entropy_access: bool,
    #[serde(default)]
    pub namespace_id: String,
    #[serde(default)]
    pub running_version: String,
    /// Check-and-set version for tunes.
    #[serde(default)]
    pub version: u64,
}

impl MountEntry {
    /// Allocate a new entry with fresh uuid and accessor.
    #[must_use]
    pub fn new(path: impl Into<String>, entry_type: impl Into<String>) -> Self {
        let entry_type = entry_type.into();
        let uuid = uuid::Uuid::new_v4().to_string();
        let accessor = format!(
            "{}_{}",
            entry_type,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            uuid,
            path: normalize_mount_path(path.into()),
            entry_type,
            accessor,
            description: String::new(),
            config: MountConfig::default(),
            local: false,
            seal_wrap: false,
            external_entropy_access: false,
            namespace_id: String::new(),
            running_version: env!("CARGO_PKG_VERSION").to_owned(),
            version: 0,
        }
    }

    /// The storage namespace backing this mount.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("logical/{}/", self.uuid)
    }
}

/// Append a trailing `/` when missing.
#[must_use]
pub fn normalize_mount_path(mut path: String) -> String {
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

#[derive(Default, Serialize, Deserialize)]
struct MountIndex {
    uuids: Vec<String>,
}

/// The in-memory view of both tables, persisted split per entry.
pub struct MountTable {
    barrier: Arc<Barrier>,
    secret: RwLock<HashMap<String, MountEntry>>,
    auth: RwLock<HashMap<String, MountEntry>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable").finish_non_exhaustive()
    }
}

impl MountTable {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            secret: RwLock::new(HashMap::new()),
            auth: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, table_type: MountTableType) -> &RwLock<HashMap<String, MountEntry>> {
        match table_type {
            MountTableType::Secret => &self.secret,
            MountTableType::Auth => &self.auth,
        }
    }

    /// Load both tables from storage. Called post-unseal and on
    /// invalidation.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures; undecodable records fail the load.
    pub async fn load(&self) -> Result<(), MountError> {
        for table_type in [MountTableType::Secret, MountTableType::Auth] {
            let mut loaded = HashMap::new();
            if let Some(raw) = self.barrier.get(table_type.index_key()).await? {
                let index: MountIndex =
                    serde_json::from_slice(&raw).map_err(|e| MountError::Serialization {
                        reason: format!("mount index undecodable: {e}"),
                    })?;
                for uuid in index.uuids {
                    let key = format!("{}{uuid}", table_type.record_prefix());
                    let Some(raw) = self.barrier.get(&key).await? else {
                        // Record removed between index read and record read;
                        // the next invalidation pass converges.
                        continue;
                    };
                    let entry: MountEntry =
                        serde_json::from_slice(&raw).map_err(|e| MountError::Serialization {
                            reason: format!("mount record '{uuid}' undecodable: {e}"),
                        })?;
                    loaded.insert(entry.uuid.clone(), entry);
                }
            }
            *self.table(table_type).write().await = loaded;
        }
        Ok(())
    }

    /// Add a mount: record first, index last.
    ///
    /// # Errors
    ///
    /// - [`MountError::ProtectedPath`] for reserved prefixes.
    /// - [`MountError::AlreadyMounted`] on path collision (either
    ///   direction: new under existing or existing under new).
    pub async fn add(
        &self,
        table_type: MountTableType,
        entry: MountEntry,
    ) -> Result<(), MountError> {
        if entry.path == "/" || entry.path.starts_with('/') {
            return Err(MountError::InvalidPath {
                reason: "mount path must be relative and non-empty".to_owned(),
            });
        }
        for protected in PROTECTED_PREFIXES {
            if entry.path.starts_with(protected) || protected.starts_with(&entry.path) {
                return Err(MountError::ProtectedPath {
                    path: entry.path.clone(),
                });
            }
        }

        let mut table = self.table(table_type).write().await;
        for existing in table.values() {
            if entry.path.starts_with(&existing.path) || existing.path.starts_with(&entry.path) {
                return Err(MountError::AlreadyMounted {
                    path: entry.path.clone(),
                });
            }
        }

        self.persist_record(table_type, &entry).await?;
        table.insert(entry.uuid.clone(), entry.clone());
        self.persist_index(table_type, &table).await?;

        info!(path = %entry.path, engine = %entry.entry_type, "mount added");
        Ok(())
    }

    /// Remove a mount by path: index first, record last.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotFound`] when no mount has this path.
    pub async fn remove(
        &self,
        table_type: MountTableType,
        path: &str,
    ) -> Result<MountEntry, MountError> {
        let path = normalize_mount_path(path.to_owned());
        let mut table = self.table(table_type).write().await;

        let uuid = table
            .values()
            .find(|e| e.path == path)
            .map(|e| e.uuid.clone())
            .ok_or_else(|| MountError::NotFound { path: path.clone() })?;

        let entry = table.remove(&uuid).unwrap_or_else(|| unreachable!());
        self.persist_index(table_type, &table).await?;
        self.barrier
            .delete(&format!("{}{uuid}", table_type.record_prefix()))
            .await?;

        info!(path = %path, "mount removed");
        Ok(entry)
    }

    /// Update a mount's tunable config with check-and-set on its version.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] for an unknown path.
    /// - [`MountError::CasMismatch`] when `cas` does not match.
    pub async fn tune(
        &self,
        table_type: MountTableType,
        path: &str,
        config: MountConfig,
        cas: Option<u64>,
    ) -> Result<MountEntry, MountError> {
        let path = normalize_mount_path(path.to_owned());
        let mut table = self.table(table_type).write().await;

        let entry = table
            .values_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| MountError::NotFound { path: path.clone() })?;

        if let Some(expected) = cas {
            if expected != entry.version {
                return Err(MountError::CasMismatch {
                    path,
                    expected,
                    found: entry.version,
                });
            }
        }

        entry.config = config;
        entry.version += 1;
        let updated = entry.clone();
        self.persist_record(table_type, &updated).await?;

        info!(path = %updated.path, version = updated.version, "mount tuned");
        Ok(updated)
    }

    /// Rename a mount path in place (remount). The entry keeps its uuid,
    /// accessor, and backing storage.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] for an unknown source.
    /// - [`MountError::AlreadyMounted`] when the target collides.
    pub async fn rename(
        &self,
        table_type: MountTableType,
        from: &str,
        to: &str,
    ) -> Result<MountEntry, MountError> {
        let from = normalize_mount_path(from.to_owned());
        let to = normalize_mount_path(to.to_owned());
        for protected in PROTECTED_PREFIXES {
            if to.starts_with(protected) || protected.starts_with(&to) {
                return Err(MountError::ProtectedPath { path: to });
            }
        }

        let mut table = self.table(table_type).write().await;
        if table.values().any(|e| {
            e.path != from && (to.starts_with(&e.path) || e.path.starts_with(&to))
        }) {
            return Err(MountError::AlreadyMounted { path: to });
        }

        let entry = table
            .values_mut()
            .find(|e| e.path == from)
            .ok_or_else(|| MountError::NotFound { path: from.clone() })?;

        entry.path = to.clone();
        entry.version += 1;
        let updated = entry.clone();
        self.persist_record(table_type, &updated).await?;

        info!(from = %from, to = %to, "mount renamed");
        Ok(updated)
    }

    /// Find a mount by exact path.
    pub async fn find(&self, table_type: MountTableType, path: &str) -> Option<MountEntry> {
        let path = normalize_mount_path(path.to_owned());
        self.table(table_type)
            .read()
            .await
            .values()
            .find(|e| e.path == path)
            .cloned()
    }

    /// All entries of one table, sorted by path.
    pub async fn list(&self, table_type: MountTableType) -> Vec<MountEntry> {
        let mut entries: Vec<MountEntry> = self
            .table(table_type)
            .read()
            .await
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    async fn persist_record(
        &self,
        table_type: MountTableType,
        entry: &MountEntry,
    ) -> Result<(), MountError> {
        let raw = serde_json::to_vec(entry).map_err(|e| MountError::Serialization {
            reason: format!("mount record encoding failed: {e}"),
        })?;
        let key = format!("{}{}", table_type.record_prefix(), entry.uuid);
        self.barrier.put(&key, &raw).await?;
        Ok(())
    }

    async fn persist_index(
        &self,
        table_type: MountTableType,
        table: &HashMap<String, MountEntry>,
    ) -> Result<(), MountError> {
        let mut uuids: Vec<String> = table.keys().cloned().collect();
        uuids.sort();
        let raw = serde_json::to_vec(&MountIndex { uuids }).map_err(|e| {
            MountError::Serialization {
                reason: format!("mount index encoding failed: {e}"),
            }
        })?;
        self.barrier.put(table_type.index_key(), &raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use citadel_storage::MemoryBackend;

    async fn make_table() -> (Arc<Barrier>, MountTable) {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.initialize(EncryptionKey::generate()).await.unwrap();
        (Arc::clone(&barrier), MountTable::new(barrier))
    }

    #[tokio::test]
    async fn add_find_remove_roundtrip() {
        let (_, table) = make_table().await;
        let entry = MountEntry::new("secret/", "kv");
        let uuid = entry.uuid.clone();
        table.add(MountTableType::Secret, entry).await.unwrap();

        let found = table.find(MountTableType::Secret, "secret/").await.unwrap();
        assert_eq!(found.uuid, uuid);
        assert_eq!(found.entry_type, "kv");
        assert!(found.accessor.starts_with("kv_"));

        let removed = table.remove(MountTableType::Secret, "secret/").await.unwrap();
        assert_eq!(removed.uuid, uuid);
        assert!(table.find(MountTableType::Secret, "secret/").await.is_none());
    }

    #[tokio::test]
    async fn protected_prefixes_rejected() {
        let (_, table) = make_table().await;
        for path in ["sys/", "sys/tools/", "cubbyhole/", "auth/token/"] {
            let err = table
                .add(MountTableType::Secret, MountEntry::new(path, "kv"))
                .await
                .unwrap_err();
            assert!(matches!(err, MountError::ProtectedPath { .. }), "{path}");
        }
    }

    #[tokio::test]
    async fn nested_collisions_rejected_both_directions() {
        let (_, table) = make_table().await;
        table
            .add(MountTableType::Secret, MountEntry::new("apps/", "kv"))
            .await
            .unwrap();

        // New mount under an existing one.
        let err = table
            .add(MountTableType::Secret, MountEntry::new("apps/nested/", "kv"))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::AlreadyMounted { .. }));

        // Existing mount under the new one.
        table
            .add(MountTableType::Secret, MountEntry::new("deep/inner/", "kv"))
            .await
            .unwrap();
        let err = table
            .add(MountTableType::Secret, MountEntry::new("deep/", "kv"))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::AlreadyMounted { .. }));

        // Siblings that merely share leading characters are fine.
        table
            .add(MountTableType::Secret, MountEntry::new("app/", "kv"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exact_duplicate_rejected() {
        let (_, table) = make_table().await;
        table
            .add(MountTableType::Secret, MountEntry::new("secret/", "kv"))
            .await
            .unwrap();
        let err = table
            .add(MountTableType::Secret, MountEntry::new("secret", "kv"))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::AlreadyMounted { .. }));
    }

    #[tokio::test]
    async fn load_rebuilds_from_split_records() {
        let (barrier, table) = make_table().await;
        table
            .add(MountTableType::Secret, MountEntry::new("secret/", "kv"))
            .await
            .unwrap();
        table
            .add(MountTableType::Auth, MountEntry::new("auth/userpass/", "userpass"))
            .await
            .unwrap();

        // A fresh table over the same barrier sees both mounts.
        let reloaded = MountTable::new(barrier);
        reloaded.load().await.unwrap();
        assert!(reloaded.find(MountTableType::Secret, "secret/").await.is_some());
        assert!(reloaded
            .find(MountTableType::Auth, "auth/userpass/")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn tune_bumps_version_and_checks_cas() {
        let (_, table) = make_table().await;
        table
            .add(MountTableType::Secret, MountEntry::new("secret/", "kv"))
            .await
            .unwrap();

        let tuned = table
            .tune(
                MountTableType::Secret,
                "secret/",
                MountConfig {
                    default_lease_ttl: Some(600),
                    ..MountConfig::default()
                },
                Some(0),
            )
            .await
            .unwrap();
        assert_eq!(tuned.version, 1);
        assert_eq!(tuned.config.default_lease_ttl, Some(600));

        let err = table
            .tune(
                MountTableType::Secret,
                "secret/",
                MountConfig::default(),
                Some(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::CasMismatch { .. }));
    }

    #[tokio::test]
    async fn rename_preserves_identity() {
        let (_, table) = make_table().await;
        let entry = MountEntry::new("old/", "kv");
        let uuid = entry.uuid.clone();
        table.add(MountTableType::Secret, entry).await.unwrap();

        let renamed = table
            .rename(MountTableType::Secret, "old/", "new/")
            .await
            .unwrap();
        assert_eq!(renamed.uuid, uuid);
        assert_eq!(renamed.path, "new/");
        assert!(table.find(MountTableType::Secret, "old/").await.is_none());
    }

    #[tokio::test]
    async fn storage_prefix_is_uuid_scoped() {
        let entry = MountEntry::new("secret/", "kv");
        assert_eq!(entry.storage_prefix(), format!("logical/{}/", entry.uuid));
    }
}
