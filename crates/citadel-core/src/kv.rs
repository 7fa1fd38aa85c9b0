//! Versioned key-value secrets engine.
//!
//! Each write creates a new version; reads return the latest non-deleted
//! version. Deletes are soft (the version is tombstoned, history kept).
//! Old versions are pruned past `max_versions`.
//!
//! Storage layout under the engine's view:
//! - `data/<path>` — the versioned secret record

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::barrier::BarrierView;
use crate::engine::{Engine, EngineRequest, EngineResponse, Operation};
use crate::error::LogicalError;

/// Versions kept per secret by default.
const DEFAULT_MAX_VERSIONS: u32 = 10;

/// A stored secret with version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSecret {
    versions: HashMap<u32, KvVersion>,
    current_version: u32,
    max_versions: u32,
}

/// One version of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvVersion {
    data: serde_json::Map<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

/// The KV engine.
pub struct KvEngine {
    view: BarrierView,
}

impl std::fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEngine")
            .field("prefix", &self.view.prefix())
            .finish_non_exhaustive()
    }
}

impl KvEngine {
    #[must_use]
    pub fn new(view: BarrierView) -> Self {
        Self { view }
    }

    fn storage_key(path: &str) -> String {
        format!("data/{path}")
    }

    async fn load(&self, path: &str) -> Result<Option<KvSecret>, LogicalError> {
        let Some(raw) = self.view.get(&Self::storage_key(path)).await? else {
            return Ok(None);
        };
        let secret = serde_json::from_slice(&raw).map_err(|e| LogicalError::Internal {
            reason: format!("secret record undecodable: {e}"),
        })?;
        Ok(Some(secret))
    }

    async fn save(&self, path: &str, secret: &KvSecret) -> Result<(), LogicalError> {
        let raw = serde_json::to_vec(secret).map_err(|e| LogicalError::Internal {
            reason: format!("secret record encoding failed: {e}"),
        })?;
        self.view.put(&Self::storage_key(path), &raw).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<EngineResponse, LogicalError> {
        let secret = self.load(path).await?.ok_or_else(|| LogicalError::NotFound {
            path: path.to_owned(),
        })?;

        let version = secret
            .versions
            .get(&secret.current_version)
            .ok_or_else(|| LogicalError::Internal {
                reason: format!("version {} missing", secret.current_version),
            })?;

        if version.deleted_at.is_some() {
            return Err(LogicalError::NotFound {
                path: path.to_owned(),
            });
        }

        Ok(EngineResponse::with_data(serde_json::json!({
            "data": version.data,
            "metadata": {
                "version": secret.current_version,
                "created_time": version.created_at.to_rfc3339(),
            }
        })))
    }

    async fn write(
        &self,
        path: &str,
        data: Option<serde_json::Value>,
    ) -> Result<EngineResponse, LogicalError> {
        let body = extract_data_map(data)?;

        let mut secret = self.load(path).await?.unwrap_or(KvSecret {
            versions: HashMap::new(),
            current_version: 0,
            max_versions: DEFAULT_MAX_VERSIONS,
        });

        secret.current_version += 1;
        let now = Utc::now();
        secret.versions.insert(
            secret.current_version,
            KvVersion {
                data: body,
                created_at: now,
                deleted_at: None,
            },
        );
        prune_versions(&mut secret);

        self.save(path, &secret).await?;
        Ok(EngineResponse::with_data(serde_json::json!({
            "version": secret.current_version,
            "created_time": now.to_rfc3339(),
        })))
    }

    async fn patch(
        &self,
        path: &str,
        data: Option<serde_json::Value>,
    ) -> Result<EngineResponse, LogicalError> {
        let patch = extract_data_map(data)?;

        let secret = self.load(path).await?.ok_or_else(|| LogicalError::NotFound {
            path: path.to_owned(),
        })?;
        let current = secret
            .versions
            .get(&secret.current_version)
            .filter(|v| v.deleted_at.is_none())
            .ok_or_else(|| LogicalError::NotFound {
                path: path.to_owned(),
            })?;

        // JSON merge: null removes a key, anything else overwrites.
        let mut merged = current.data.clone();
        for (k, v) in patch {
            if v.is_null() {
                merged.remove(&k);
            } else {
                merged.insert(k, v);
            }
        }

        self.write(path, Some(serde_json::json!({ "data": merged })))
            .await
    }

    async fn delete(&self, path: &str) -> Result<EngineResponse, LogicalError> {
        let mut secret = self.load(path).await?.ok_or_else(|| LogicalError::NotFound {
            path: path.to_owned(),
        })?;
        if let Some(version) = secret.versions.get_mut(&secret.current_version) {
            version.deleted_at = Some(Utc::now());
        }
        self.save(path, &secret).await?;
        Ok(EngineResponse::empty())
    }

    async fn list(&self, req: &EngineRequest) -> Result<EngineResponse, LogicalError> {
        let prefix = if req.path.is_empty() {
            "data/".to_owned()
        } else {
            format!("data/{}/", req.path.trim_end_matches('/'))
        };
        let (after, limit) = req
            .page
            .as_ref()
            .map_or((String::new(), -1), |p| (p.after.clone(), p.limit));

        let keys = self.view.list_page(&prefix, &after, limit).await?;
        Ok(EngineResponse::with_data(serde_json::json!({ "keys": keys })))
    }

    async fn scan(&self, req: &EngineRequest) -> Result<EngineResponse, LogicalError> {
        let prefix = if req.path.is_empty() {
            "data/".to_owned()
        } else {
            format!("data/{}/", req.path.trim_end_matches('/'))
        };
        let keys = self.view.list(&prefix).await?;
        let keys: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .collect();
        Ok(EngineResponse::with_data(serde_json::json!({ "keys": keys })))
    }
}

/// Pull the `data` object out of a write body, accepting both the nested
/// (`{"data": {...}}`) and flat (`{...}`) forms.
fn extract_data_map(
    data: Option<serde_json::Value>,
) -> Result<serde_json::Map<String, serde_json::Value>, LogicalError> {
    match data {
        Some(serde_json::Value::Object(mut map)) => {
            if let Some(serde_json::Value::Object(inner)) = map.remove("data") {
                Ok(inner)
            } else if map.contains_key("data") {
                Err(LogicalError::InvalidRequest {
                    reason: "'data' must be an object".to_owned(),
                })
            } else {
                Ok(map)
            }
        }
        Some(_) => Err(LogicalError::InvalidRequest {
            reason: "request body must be a JSON object".to_owned(),
        }),
        None => Err(LogicalError::InvalidRequest {
            reason: "missing request body".to_owned(),
        }),
    }
}

fn prune_versions(secret: &mut KvSecret) {
    if secret.max_versions == 0 {
        return;
    }
    while secret.versions.len() > secret.max_versions as usize {
        if let Some(min) = secret.versions.keys().copied().min() {
            secret.versions.remove(&min);
        } else {
            break;
        }
    }
}

#[async_trait::async_trait]
impl Engine for KvEngine {
    fn engine_type(&self) -> &'static str {
        "kv"
    }

    async fn handle(&self, req: EngineRequest) -> Result<EngineResponse, LogicalError> {
        match req.operation {
            Operation::Read => self.read(&req.path).await,
            Operation::Create | Operation::Update => self.write(&req.path, req.data).await,
            Operation::Patch => self.patch(&req.path, req.data).await,
            Operation::Delete => self.delete(&req.path).await,
            Operation::List => self.list(&req).await,
            Operation::Scan => self.scan(&req).await,
            // KV secrets carry no leases; nothing to renew or revoke.
            Operation::Renew | Operation::Revoke => Err(LogicalError::UnsupportedOperation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::Barrier;
    use crate::crypto::EncryptionKey;
    use crate::engine::PageArgs;
    use citadel_storage::MemoryBackend;
    use std::sync::Arc;

    async fn make_engine() -> KvEngine {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.initialize(EncryptionKey::generate()).await.unwrap();
        KvEngine::new(BarrierView::new(barrier, "logical/test/"))
    }

    fn write_req(path: &str, body: serde_json::Value) -> EngineRequest {
        EngineRequest {
            operation: Operation::Update,
            path: path.to_owned(),
            data: Some(body),
            token_accessor: None,
            page: None,
        }
    }

    #[tokio::test]
    async fn write_then_read_latest() {
        let engine = make_engine().await;
        engine
            .handle(write_req("app/config", serde_json::json!({"data": {"v": "world"}})))
            .await
            .unwrap();

        let resp = engine
            .handle(EngineRequest::new(Operation::Read, "app/config"))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["data"]["v"], "world");
        assert_eq!(data["metadata"]["version"], 1);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let engine = make_engine().await;
        let err = engine
            .handle(EngineRequest::new(Operation::Read, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::NotFound { .. }));
    }

    #[tokio::test]
    async fn writes_version_and_read_returns_newest() {
        let engine = make_engine().await;
        for i in 1..=3 {
            engine
                .handle(write_req("app", serde_json::json!({"data": {"n": i}})))
                .await
                .unwrap();
        }
        let resp = engine
            .handle(EngineRequest::new(Operation::Read, "app"))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["data"]["n"], 3);
        assert_eq!(data["metadata"]["version"], 3);
    }

    #[tokio::test]
    async fn patch_merges_and_null_removes() {
        let engine = make_engine().await;
        engine
            .handle(write_req(
                "app",
                serde_json::json!({"data": {"keep": "a", "drop": "b"}}),
            ))
            .await
            .unwrap();

        let mut req = write_req(
            "app",
            serde_json::json!({"data": {"drop": null, "new": "c"}}),
        );
        req.operation = Operation::Patch;
        engine.handle(req).await.unwrap();

        let resp = engine
            .handle(EngineRequest::new(Operation::Read, "app"))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["data"]["keep"], "a");
        assert_eq!(data["data"]["new"], "c");
        assert!(data["data"].get("drop").is_none());
    }

    #[tokio::test]
    async fn delete_tombstones_latest() {
        let engine = make_engine().await;
        engine
            .handle(write_req("app", serde_json::json!({"data": {"v": 1}})))
            .await
            .unwrap();
        engine
            .handle(EngineRequest::new(Operation::Delete, "app"))
            .await
            .unwrap();

        let err = engine
            .handle(EngineRequest::new(Operation::Read, "app"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_paginates_one_level() {
        let engine = make_engine().await;
        for name in ["a1", "a2", "a3", "a4"] {
            engine
                .handle(write_req(
                    &format!("apps/{name}"),
                    serde_json::json!({"data": {"x": 1}}),
                ))
                .await
                .unwrap();
        }

        let mut req = EngineRequest::new(Operation::List, "apps");
        req.page = Some(PageArgs {
            after: String::new(),
            limit: 2,
        });
        let resp = engine.handle(req).await.unwrap();
        assert_eq!(
            resp.data.unwrap()["keys"],
            serde_json::json!(["a1", "a2"])
        );

        let mut req = EngineRequest::new(Operation::List, "apps");
        req.page = Some(PageArgs {
            after: "a2".to_owned(),
            limit: 2,
        });
        let resp = engine.handle(req).await.unwrap();
        assert_eq!(
            resp.data.unwrap()["keys"],
            serde_json::json!(["a3", "a4"])
        );
    }

    #[tokio::test]
    async fn scan_lists_recursively() {
        let engine = make_engine().await;
        engine
            .handle(write_req("a/b/c", serde_json::json!({"data": {"x": 1}})))
            .await
            .unwrap();
        engine
            .handle(write_req("a/d", serde_json::json!({"data": {"x": 1}})))
            .await
            .unwrap();

        let resp = engine
            .handle(EngineRequest::new(Operation::Scan, "a"))
            .await
            .unwrap();
        assert_eq!(
            resp.data.unwrap()["keys"],
            serde_json::json!(["b/c", "d"])
        );
    }

    #[tokio::test]
    async fn old_versions_pruned() {
        let engine = make_engine().await;
        for i in 0..(DEFAULT_MAX_VERSIONS + 5) {
            engine
                .handle(write_req("app", serde_json::json!({"data": {"n": i}})))
                .await
                .unwrap();
        }
        let secret = engine.load("app").await.unwrap().unwrap();
        assert_eq!(secret.versions.len(), DEFAULT_MAX_VERSIONS as usize);
        assert_eq!(secret.current_version, DEFAULT_MAX_VERSIONS + 5);
    }

    #[tokio::test]
    async fn non_object_body_rejected() {
        let engine = make_engine().await;
        let err = engine
            .handle(write_req("app", serde_json::json!("just a string")))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::InvalidRequest { .. }));
    }
}
