//! The engine contract and registry.
//!
//! Every secret/auth engine presents the same surface to the router: a
//! `handle` method taking a logical request, plus lifecycle hooks. Engines
//! receive a [`BarrierView`] scoped to their mount's `logical/<uuid>/`
//! namespace, so no engine can read another's storage.
//!
//! The registry maps engine type names to factories; mounting instantiates
//! an engine from its factory with a fresh view.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::barrier::BarrierView;
use crate::error::{LogicalError, MountError};
use crate::policy::Capability;

/// Logical operations, mapped from HTTP verbs by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    List,
    /// Recursive list.
    Scan,
    Patch,
    /// Engine-side renewal of a leased secret.
    Renew,
    /// Engine-side revocation of a leased secret.
    Revoke,
}

impl Operation {
    /// The ACL capability this operation requires.
    #[must_use]
    pub fn capability(self) -> Capability {
        match self {
            Self::Read => Capability::Read,
            Self::Create => Capability::Create,
            Self::Update | Self::Renew | Self::Revoke => Capability::Update,
            Self::Delete => Capability::Delete,
            Self::List => Capability::List,
            Self::Scan => Capability::Scan,
            Self::Patch => Capability::Patch,
        }
    }
}

/// Pagination arguments for list/scan.
#[derive(Debug, Clone, Default)]
pub struct PageArgs {
    /// Exclusive cursor: last key of the previous page.
    pub after: String,
    /// `-1` = unbounded, `0` = empty page.
    pub limit: i64,
}

/// A logical request as an engine sees it: path relative to the mount.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub operation: Operation,
    pub path: String,
    pub data: Option<serde_json::Value>,
    /// Accessor of the requesting token; engines that scope storage per
    /// token (cubbyhole) require it.
    pub token_accessor: Option<String>,
    pub page: Option<PageArgs>,
}

impl EngineRequest {
    /// A bare request with no body.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: None,
            token_accessor: None,
            page: None,
        }
    }
}

/// A lease the engine asks the core to track for a returned secret.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    pub ttl_secs: i64,
    pub max_ttl_secs: Option<i64>,
    pub renewable: bool,
    /// Engine-private data replayed to the engine at revocation time.
    pub internal_data: Option<serde_json::Value>,
}

/// An authentication grant returned by an auth engine login.
#[derive(Debug, Clone)]
pub struct AuthSpec {
    pub policies: Vec<String>,
    pub ttl_secs: Option<i64>,
    pub entity_id: Option<String>,
    pub display_name: String,
    pub renewable: bool,
}

/// An engine's answer to a logical request.
#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    pub data: Option<serde_json::Value>,
    pub secret: Option<SecretSpec>,
    pub auth: Option<AuthSpec>,
    pub warnings: Vec<String>,
}

impl EngineResponse {
    /// A response carrying only data.
    #[must_use]
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// An empty 204-style response.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The uniform engine contract.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// The engine's registered type name.
    fn engine_type(&self) -> &'static str;

    /// Handle one logical request.
    ///
    /// # Errors
    ///
    /// Returns a [`LogicalError`] kind the router maps onto the transport.
    async fn handle(&self, req: EngineRequest) -> Result<EngineResponse, LogicalError>;

    /// Called once after the engine is mounted or loaded post-unseal.
    ///
    /// # Errors
    ///
    /// Returns a [`LogicalError`] when setup fails; the mount is aborted.
    async fn initialize(&self) -> Result<(), LogicalError> {
        Ok(())
    }

    /// Storage-invalidation hook (another node wrote under this key).
    async fn invalidate(&self, _key: &str) {}

    /// Called before unmount or seal; release external resources.
    async fn cleanup(&self) {}
}

/// Factory producing an engine instance over a mount-scoped view.
pub type EngineFactory = Arc<dyn Fn(BarrierView) -> Arc<dyn Engine> + Send + Sync>;

/// Maps engine type names to factories.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("EngineRegistry")
            .field("types", &types)
            .finish()
    }
}

impl EngineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a type name.
    pub fn register(&mut self, engine_type: impl Into<String>, factory: EngineFactory) {
        self.factories.insert(engine_type.into(), factory);
    }

    /// Instantiate an engine of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::UnknownEngineType`] for unregistered types.
    pub fn create(
        &self,
        engine_type: &str,
        view: BarrierView,
    ) -> Result<Arc<dyn Engine>, MountError> {
        let factory = self
            .factories
            .get(engine_type)
            .ok_or_else(|| MountError::UnknownEngineType {
                engine_type: engine_type.to_owned(),
            })?;
        Ok(factory(view))
    }

    /// Whether a type is registered.
    #[must_use]
    pub fn contains(&self, engine_type: &str) -> bool {
        self.factories.contains_key(engine_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_capability_mapping() {
        assert_eq!(Operation::Read.capability(), Capability::Read);
        assert_eq!(Operation::Create.capability(), Capability::Create);
        assert_eq!(Operation::Update.capability(), Capability::Update);
        assert_eq!(Operation::Delete.capability(), Capability::Delete);
        assert_eq!(Operation::List.capability(), Capability::List);
        assert_eq!(Operation::Scan.capability(), Capability::Scan);
        assert_eq!(Operation::Patch.capability(), Capability::Patch);
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = EngineRegistry::new();
        assert!(!registry.contains("kv"));
    }
}
