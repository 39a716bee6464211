//! In-process proxy routing table

use async_trait::async_trait;
use dashmap::DashMap;

use sh_core::error::ProxyError;
use sh_core::traits::ProxyBackend;
use sh_core::types::RouteEntry;

/// Routing table held in memory.
///
/// Stands in for an external proxy in single-node deployments and tests.
pub struct InMemoryProxy {
    /// Targets indexed by path prefix
    routes: DashMap<String, String>,
}

impl InMemoryProxy {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Target for a path prefix
    pub fn get(&self, path_prefix: &str) -> Option<String> {
        self.routes.get(path_prefix).map(|r| r.value().clone())
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for InMemoryProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyBackend for InMemoryProxy {
    async fn put_route(&self, path_prefix: &str, target_url: &str) -> Result<(), ProxyError> {
        self.routes
            .insert(path_prefix.to_string(), target_url.to_string());
        Ok(())
    }

    async fn delete_route(&self, path_prefix: &str) -> Result<(), ProxyError> {
        self.routes
            .remove(path_prefix)
            .map(|_| ())
            .ok_or_else(|| ProxyError::NotFound(path_prefix.to_string()))
    }

    async fn list_routes(&self) -> Result<Vec<RouteEntry>, ProxyError> {
        Ok(self
            .routes
            .iter()
            .map(|r| RouteEntry::new(r.key().clone(), r.value().clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_replaces_target() {
        let proxy = InMemoryProxy::new();
        proxy.put_route("/user/a/", "http://one").await.unwrap();
        proxy.put_route("/user/a/", "http://two").await.unwrap();
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy.get("/user/a/").as_deref(), Some("http://two"));
    }

    #[tokio::test]
    async fn test_delete_missing_reports_not_found() {
        let proxy = InMemoryProxy::new();
        let err = proxy.delete_route("/user/ghost/").await.unwrap_err();
        assert_eq!(err, ProxyError::NotFound("/user/ghost/".into()));
    }
}
