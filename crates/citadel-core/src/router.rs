//! The mount router: a path-segment trie mapping request paths to running
//! engine instances.
//!
//! Lookup is longest-prefix with trailing-`/` normalization: a request for
//! `secret/data/foo` resolves to the mount at `secret/`, with `data/foo`
//! left over for the engine. The trie is rebuilt incrementally as mounts
//! come and go; request handling takes the read side only.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::engine::Engine;
use crate::error::MountError;
use crate::mount::MountEntry;

/// A mounted, running engine.
pub struct RouteEntry {
    pub mount: MountEntry,
    pub engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("path", &self.mount.path)
            .field("engine", &self.engine.engine_type())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    value: Option<Arc<RouteEntry>>,
}

impl TrieNode {
    fn remove(&mut self, segments: &[&str]) -> Option<Arc<RouteEntry>> {
        match segments.split_first() {
            None => self.value.take(),
            Some((head, rest)) => {
                let child = self.children.get_mut(*head)?;
                let removed = child.remove(rest);
                if child.children.is_empty() && child.value.is_none() {
                    self.children.remove(*head);
                }
                removed
            }
        }
    }
}

/// The router.
#[derive(Default)]
pub struct Router {
    root: RwLock<TrieNode>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

fn segments_of(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mount and its engine at the mount's path.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::AlreadyMounted`] when the exact path is taken.
    pub async fn mount(&self, mount: MountEntry, engine: Arc<dyn Engine>) -> Result<(), MountError> {
        let path = mount.path.clone();
        let entry = Arc::new(RouteEntry { mount, engine });

        let mut root = self.root.write().await;
        let mut node = &mut *root;
        for segment in segments_of(&path) {
            node = node.children.entry(segment.to_owned()).or_default();
        }
        if node.value.is_some() {
            return Err(MountError::AlreadyMounted { path });
        }
        node.value = Some(entry);
        Ok(())
    }

    /// Remove the mount at the given path, returning it for cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotFound`] when nothing is mounted there.
    pub async fn unmount(&self, path: &str) -> Result<Arc<RouteEntry>, MountError> {
        let mut root = self.root.write().await;
        root.remove(&segments_of(path))
            .ok_or_else(|| MountError::NotFound {
                path: path.to_owned(),
            })
    }

    /// Resolve a request path to its deepest mount.
    ///
    /// Returns the route and the remaining path relative to the mount.
    pub async fn resolve(&self, path: &str) -> Option<(Arc<RouteEntry>, String)> {
        let root = self.root.read().await;
        let segments = segments_of(path);

        let mut node = &*root;
        let mut best: Option<(Arc<RouteEntry>, usize)> = None;
        if let Some(value) = &node.value {
            best = Some((Arc::clone(value), 0));
        }
        for (depth, segment) in segments.iter().enumerate() {
            match node.children.get(*segment) {
                Some(child) => {
                    node = child;
                    if let Some(value) = &node.value {
                        best = Some((Arc::clone(value), depth + 1));
                    }
                }
                None => break,
            }
        }

        best.map(|(entry, depth)| {
            let remainder = segments[depth..].join("/");
            (entry, remainder)
        })
    }

    /// All mounted paths, sorted. Used post-seal to run engine cleanup.
    pub async fn paths(&self) -> Vec<String> {
        fn walk(node: &TrieNode, prefix: &str, out: &mut Vec<String>) {
            if let Some(value) = &node.value {
                out.push(value.mount.path.clone());
            }
            for (segment, child) in &node.children {
                walk(child, &format!("{prefix}{segment}/"), out);
            }
        }
        let root = self.root.read().await;
        let mut out = Vec::new();
        walk(&root, "", &mut out);
        out.sort();
        out
    }

    /// Drop every route. Called during pre-seal teardown.
    pub async fn clear(&self) {
        *self.root.write().await = TrieNode::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineRequest, EngineResponse};
    use crate::error::LogicalError;

    struct NullEngine(&'static str);

    #[async_trait::async_trait]
    impl Engine for NullEngine {
        fn engine_type(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, _req: EngineRequest) -> Result<EngineResponse, LogicalError> {
            Ok(EngineResponse::empty())
        }
    }

    async fn mount_at(router: &Router, path: &str, engine_type: &'static str) {
        let entry = MountEntry::new(path, engine_type);
        router
            .mount(entry, Arc::new(NullEngine(engine_type)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_strips_mount_prefix() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;

        let (route, remainder) = router.resolve("secret/data/foo").await.unwrap();
        assert_eq!(route.mount.path, "secret/");
        assert_eq!(remainder, "data/foo");
    }

    #[tokio::test]
    async fn resolve_prefers_longest_prefix() {
        let router = Router::new();
        mount_at(&router, "auth/", "generic").await;
        mount_at(&router, "auth/token/", "token").await;

        let (route, remainder) = router.resolve("auth/token/create").await.unwrap();
        assert_eq!(route.mount.path, "auth/token/");
        assert_eq!(remainder, "create");

        let (route, _) = router.resolve("auth/userpass/login").await.unwrap();
        assert_eq!(route.mount.path, "auth/");
    }

    #[tokio::test]
    async fn resolve_unmounted_path_is_none() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        assert!(router.resolve("database/creds/ro").await.is_none());
    }

    #[tokio::test]
    async fn resolve_exact_mount_path_has_empty_remainder() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        let (_, remainder) = router.resolve("secret/").await.unwrap();
        assert_eq!(remainder, "");
    }

    #[tokio::test]
    async fn unmount_removes_route() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        router.unmount("secret/").await.unwrap();
        assert!(router.resolve("secret/data/foo").await.is_none());
        assert!(matches!(
            router.unmount("secret/").await,
            Err(MountError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_mount_rejected() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        let entry = MountEntry::new("secret/", "kv");
        let err = router
            .mount(entry, Arc::new(NullEngine("kv")))
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::AlreadyMounted { .. }));
    }

    #[tokio::test]
    async fn paths_lists_all_mounts() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        mount_at(&router, "cubbyhole/", "cubbyhole").await;
        mount_at(&router, "auth/token/", "token").await;

        assert_eq!(
            router.paths().await,
            vec!["auth/token/", "cubbyhole/", "secret/"]
        );
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let router = Router::new();
        mount_at(&router, "secret/", "kv").await;
        router.clear().await;
        assert!(router.paths().await.is_empty());
    }
}
