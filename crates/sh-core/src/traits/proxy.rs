//! Proxy backend trait

use async_trait::async_trait;

use crate::error::ProxyError;
use crate::types::RouteEntry;

/// Routing table of the external proxy.
///
/// Assumed eventually consistent: `put_route` on an existing identical entry
/// and `delete_route` on a missing one may both be issued.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Route `path_prefix` to `target_url`, replacing any existing target
    async fn put_route(&self, path_prefix: &str, target_url: &str) -> Result<(), ProxyError>;

    /// Remove the route for `path_prefix`
    async fn delete_route(&self, path_prefix: &str) -> Result<(), ProxyError>;

    /// All routes currently in the table
    async fn list_routes(&self) -> Result<Vec<RouteEntry>, ProxyError>;
}
