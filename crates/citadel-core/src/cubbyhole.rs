//! Per-token private storage.
//!
//! Every token gets its own cubbyhole, keyed by the token's accessor. No
//! policy can grant one token access to another's cubbyhole, because the
//! storage key embeds the requesting token's accessor. The cubbyhole is
//! destroyed when the token is revoked; response wrapping stores wrapped
//! payloads here under single-use wrapping tokens.

use serde::{Deserialize, Serialize};

use crate::barrier::BarrierView;
use crate::engine::{Engine, EngineRequest, EngineResponse, Operation};
use crate::error::LogicalError;

/// A stored cubbyhole value.
#[derive(Debug, Serialize, Deserialize)]
struct CubbyEntry {
    data: serde_json::Map<String, serde_json::Value>,
}

/// The cubbyhole engine.
pub struct CubbyholeEngine {
    view: BarrierView,
}

impl std::fmt::Debug for CubbyholeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubbyholeEngine").finish_non_exhaustive()
    }
}

impl CubbyholeEngine {
    #[must_use]
    pub fn new(view: BarrierView) -> Self {
        Self { view }
    }

    fn scoped_key(accessor: &str, path: &str) -> String {
        format!("{accessor}/{path}")
    }

    fn accessor_of(req: &EngineRequest) -> Result<&str, LogicalError> {
        req.token_accessor
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or(LogicalError::PermissionDenied)
    }

    /// Remove every entry belonging to a token. Called on token
    /// revocation.
    ///
    /// # Errors
    ///
    /// Propagates barrier failures.
    pub async fn clear_for_accessor(&self, accessor: &str) -> Result<(), LogicalError> {
        let prefix = format!("{accessor}/");
        for key in self.view.list(&prefix).await? {
            self.view.delete(&key).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for CubbyholeEngine {
    fn engine_type(&self) -> &'static str {
        "cubbyhole"
    }

    async fn handle(&self, req: EngineRequest) -> Result<EngineResponse, LogicalError> {
        let accessor = Self::accessor_of(&req)?;
        let key = Self::scoped_key(accessor, &req.path);

        match req.operation {
            Operation::Read => {
                let raw = self.view.get(&key).await?.ok_or_else(|| {
                    LogicalError::NotFound {
                        path: req.path.clone(),
                    }
                })?;
                let entry: CubbyEntry =
                    serde_json::from_slice(&raw).map_err(|e| LogicalError::Internal {
                        reason: format!("cubbyhole record undecodable: {e}"),
                    })?;
                Ok(EngineResponse::with_data(serde_json::Value::Object(
                    entry.data,
                )))
            }
            Operation::Create | Operation::Update => {
                let data = match req.data {
                    Some(serde_json::Value::Object(map)) => map,
                    Some(_) => {
                        return Err(LogicalError::InvalidRequest {
                            reason: "request body must be a JSON object".to_owned(),
                        })
                    }
                    None => {
                        return Err(LogicalError::InvalidRequest {
                            reason: "missing request body".to_owned(),
                        })
                    }
                };
                let raw = serde_json::to_vec(&CubbyEntry { data }).map_err(|e| {
                    LogicalError::Internal {
                        reason: format!("cubbyhole record encoding failed: {e}"),
                    }
                })?;
                self.view.put(&key, &raw).await?;
                Ok(EngineResponse::empty())
            }
            Operation::Delete => {
                self.view.delete(&key).await?;
                Ok(EngineResponse::empty())
            }
            Operation::List => {
                let prefix = if req.path.is_empty() {
                    format!("{accessor}/")
                } else {
                    format!("{accessor}/{}/", req.path.trim_end_matches('/'))
                };
                let (after, limit) = req
                    .page
                    .as_ref()
                    .map_or((String::new(), -1), |p| (p.after.clone(), p.limit));
                let keys = self.view.list_page(&prefix, &after, limit).await?;
                Ok(EngineResponse::with_data(serde_json::json!({ "keys": keys })))
            }
            _ => Err(LogicalError::UnsupportedOperation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::Barrier;
    use crate::crypto::EncryptionKey;
    use citadel_storage::MemoryBackend;
    use std::sync::Arc;

    async fn make_engine() -> CubbyholeEngine {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.initialize(EncryptionKey::generate()).await.unwrap();
        CubbyholeEngine::new(BarrierView::new(barrier, "cubbyhole/"))
    }

    fn req(
        op: Operation,
        path: &str,
        accessor: &str,
        data: Option<serde_json::Value>,
    ) -> EngineRequest {
        EngineRequest {
            operation: op,
            path: path.to_owned(),
            data,
            token_accessor: Some(accessor.to_owned()),
            page: None,
        }
    }

    #[tokio::test]
    async fn write_read_scoped_to_accessor() {
        let engine = make_engine().await;
        engine
            .handle(req(
                Operation::Update,
                "private",
                "acc-1",
                Some(serde_json::json!({"v": 1})),
            ))
            .await
            .unwrap();

        // The owner reads it back.
        let resp = engine
            .handle(req(Operation::Read, "private", "acc-1", None))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["v"], 1);

        // A different token sees nothing.
        let err = engine
            .handle(req(Operation::Read, "private", "acc-2", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_accessor_denied() {
        let engine = make_engine().await;
        let mut request = req(Operation::Read, "x", "", None);
        request.token_accessor = None;
        let err = engine.handle(request).await.unwrap_err();
        assert!(matches!(err, LogicalError::PermissionDenied));
    }

    #[tokio::test]
    async fn list_only_own_keys() {
        let engine = make_engine().await;
        for (accessor, path) in [("acc-1", "a"), ("acc-1", "b"), ("acc-2", "c")] {
            engine
                .handle(req(
                    Operation::Update,
                    path,
                    accessor,
                    Some(serde_json::json!({"v": 1})),
                ))
                .await
                .unwrap();
        }

        let resp = engine
            .handle(req(Operation::List, "", "acc-1", None))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["keys"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn clear_for_accessor_wipes_everything() {
        let engine = make_engine().await;
        for path in ["a", "b/c"] {
            engine
                .handle(req(
                    Operation::Update,
                    path,
                    "acc-1",
                    Some(serde_json::json!({"v": 1})),
                ))
                .await
                .unwrap();
        }

        engine.clear_for_accessor("acc-1").await.unwrap();
        let err = engine
            .handle(req(Operation::Read, "a", "acc-1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::NotFound { .. }));
    }
}
