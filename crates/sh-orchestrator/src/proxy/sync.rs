//! Keeps the external proxy's table in line with running servers

use std::collections::BTreeMap;
use std::sync::Arc;

use sh_core::error::ProxyError;
use sh_core::traits::ProxyBackend;
use sh_core::types::{RouteEntry, ServerKey};

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Routes that were missing and got added
    pub added: Vec<RouteEntry>,
    /// Routes whose target was wrong and got replaced
    pub updated: Vec<RouteEntry>,
    /// Paths that were not expected and got removed
    pub removed: Vec<String>,
    /// Individual mutations that failed (left for the next pass)
    pub failed: usize,
}

impl ReconcileReport {
    /// Whether the table was already correct
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.failed == 0
    }
}

/// Idempotent route mutations plus full-table reconciliation.
///
/// Only paths under `<base_url>user/` are managed; anything else in the proxy
/// table belongs to someone else and is left alone.
pub struct ProxySynchronizer {
    backend: Arc<dyn ProxyBackend>,
    base_url: String,
}

impl ProxySynchronizer {
    /// Create a synchronizer over `backend`
    pub fn new(backend: Arc<dyn ProxyBackend>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { backend, base_url }
    }

    /// Prefix shared by every managed route
    pub fn managed_prefix(&self) -> String {
        format!("{}user/", self.base_url)
    }

    /// Route path for a server
    pub fn route_path(&self, key: &ServerKey) -> String {
        let mut path = format!("{}{}/", self.managed_prefix(), escape_segment(&key.user));
        if !key.is_default() {
            path.push_str(&escape_segment(&key.name));
            path.push('/');
        }
        path
    }

    /// Route entry for a server running at `target_url`
    pub fn route_for(&self, key: &ServerKey, target_url: &str) -> RouteEntry {
        RouteEntry::new(self.route_path(key), target_url)
    }

    /// Add or replace a route. Re-adding an identical route is a no-op.
    pub async fn add(&self, route: &RouteEntry) -> Result<(), ProxyError> {
        tracing::debug!("Adding route {} -> {}", route.path_prefix, route.target_url);
        self.backend
            .put_route(&route.path_prefix, &route.target_url)
            .await
    }

    /// Remove a route. Removing a missing route is a no-op.
    pub async fn remove(&self, path_prefix: &str) -> Result<(), ProxyError> {
        tracing::debug!("Removing route {}", path_prefix);
        match self.backend.delete_route(path_prefix).await {
            Ok(()) | Err(ProxyError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Managed routes currently in the proxy
    pub async fn routes(&self) -> Result<Vec<RouteEntry>, ProxyError> {
        let prefix = self.managed_prefix();
        let mut routes: Vec<_> = self
            .backend
            .list_routes()
            .await?
            .into_iter()
            .filter(|r| r.path_prefix.starts_with(&prefix))
            .collect();
        routes.sort();
        Ok(routes)
    }

    /// Bring the managed part of the table to exactly `expected`.
    ///
    /// Individual failures are logged and counted; the pass carries on so one
    /// bad route does not block the rest.
    pub async fn reconcile(&self, expected: &[RouteEntry]) -> Result<ReconcileReport, ProxyError> {
        let current: BTreeMap<String, String> = self
            .routes()
            .await?
            .into_iter()
            .map(|r| (r.path_prefix, r.target_url))
            .collect();
        let wanted: BTreeMap<&str, &str> = expected
            .iter()
            .map(|r| (r.path_prefix.as_str(), r.target_url.as_str()))
            .collect();

        let mut report = ReconcileReport::default();

        for path in current.keys() {
            if wanted.contains_key(path.as_str()) {
                continue;
            }
            tracing::warn!("Removing stale route {}", path);
            match self.remove(path).await {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => {
                    tracing::warn!("Failed to remove stale route {}: {}", path, e);
                    report.failed += 1;
                }
            }
        }

        for (path, target) in wanted {
            let route = RouteEntry::new(path, target);
            let updating = match current.get(path) {
                Some(existing) if existing == target => continue,
                Some(existing) => {
                    tracing::warn!("Route {} points at {}, expected {}", path, existing, target);
                    true
                }
                None => {
                    tracing::warn!("Adding missing route {} -> {}", path, target);
                    false
                }
            };
            match self.add(&route).await {
                Ok(()) if updating => report.updated.push(route),
                Ok(()) => report.added.push(route),
                Err(e) => {
                    tracing::warn!("Failed to restore route {}: {}", path, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Percent-encode everything outside the URL-unreserved set
fn escape_segment(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::InMemoryProxy;

    fn synchronizer() -> (Arc<InMemoryProxy>, ProxySynchronizer) {
        let proxy = Arc::new(InMemoryProxy::new());
        let sync = ProxySynchronizer::new(proxy.clone(), "/hub");
        (proxy, sync)
    }

    #[test]
    fn test_route_paths() {
        let (_, sync) = synchronizer();
        assert_eq!(
            sync.route_path(&ServerKey::default_server("alice")),
            "/hub/user/alice/"
        );
        assert_eq!(
            sync.route_path(&ServerKey::new("alice", "gpu")),
            "/hub/user/alice/gpu/"
        );
        assert_eq!(
            sync.route_path(&ServerKey::new("a b", "x/y")),
            "/hub/user/a%20b/x%2Fy/"
        );
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let (proxy, sync) = synchronizer();
        let route = sync.route_for(&ServerKey::default_server("alice"), "http://127.0.0.1:9000");

        sync.add(&route).await.unwrap();
        sync.add(&route).await.unwrap();
        assert_eq!(proxy.len(), 1);

        sync.remove(&route.path_prefix).await.unwrap();
        sync.remove(&route.path_prefix).await.unwrap();
        assert!(proxy.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_converges_to_expected() {
        let (proxy, sync) = synchronizer();
        let keep = sync.route_for(&ServerKey::default_server("keep"), "http://10.0.0.1:1");
        let stale = sync.route_for(&ServerKey::default_server("stale"), "http://10.0.0.2:1");
        let moved = sync.route_for(&ServerKey::default_server("moved"), "http://10.0.0.3:1");
        let missing = sync.route_for(&ServerKey::new("missing", "lab"), "http://10.0.0.4:1");

        for route in [&keep, &stale, &moved] {
            sync.add(route).await.unwrap();
        }
        let moved_now = RouteEntry::new(moved.path_prefix.clone(), "http://10.0.0.3:2");

        let expected = vec![keep.clone(), moved_now.clone(), missing.clone()];
        let report = sync.reconcile(&expected).await.unwrap();

        assert_eq!(report.added, vec![missing.clone()]);
        assert_eq!(report.updated, vec![moved_now.clone()]);
        assert_eq!(report.removed, vec![stale.path_prefix.clone()]);
        assert_eq!(report.failed, 0);

        let mut expected_sorted = expected;
        expected_sorted.sort();
        assert_eq!(sync.routes().await.unwrap(), expected_sorted);
        assert_eq!(proxy.len(), 3);

        let again = sync.reconcile(&expected_sorted).await.unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_reconcile_leaves_foreign_routes() {
        let (proxy, sync) = synchronizer();
        proxy.put_route("/hub/", "http://127.0.0.1:8081").await.unwrap();

        let report = sync.reconcile(&[]).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(proxy.len(), 1);
    }
}
