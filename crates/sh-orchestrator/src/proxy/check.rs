//! Periodic proxy route check
//!
//! Routes can drift when the proxy restarts or someone edits its table by
//! hand. This task compares the proxy table with the registry on a fixed
//! interval and repairs the difference:
//! - running servers missing a route get one
//! - routes pointing at the wrong target are replaced
//! - routes for servers that are not running, or have no record, are removed

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;

/// Shortest interval the check will run at
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Run the route check task until `cancel` fires.
///
/// The first check runs immediately.
pub async fn run_route_check(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let period = interval.max(MIN_CHECK_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Starting route check task (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_once(&orchestrator).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Route check task shutting down");
                break;
            }
        }
    }
}

async fn check_once(orchestrator: &Orchestrator) {
    match orchestrator.check_routes().await {
        Ok(report) if report.is_noop() => {
            tracing::trace!("Proxy routes in sync");
        }
        Ok(report) => {
            tracing::info!(
                "Route check repaired proxy: {} added, {} updated, {} removed, {} failed",
                report.added.len(),
                report.updated.len(),
                report.removed.len(),
                report.failed
            );
        }
        Err(e) => {
            tracing::warn!("Route check could not read proxy table: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::InMemoryProxy;
    use async_trait::async_trait;
    use sh_core::config::HubConfig;
    use sh_core::error::DriverError;
    use sh_core::traits::{ProcessDriver, ProxyBackend};
    use sh_core::types::{ProcessStatus, ServerKey, ServerOptions};

    struct NoDriver;

    #[async_trait]
    impl ProcessDriver for NoDriver {
        async fn start(
            &self,
            _key: &ServerKey,
            _options: &ServerOptions,
            _cancel: CancellationToken,
        ) -> Result<String, DriverError> {
            Err(DriverError::Failed("unused".into()))
        }

        async fn stop(&self, _key: &ServerKey) -> Result<(), DriverError> {
            Ok(())
        }

        fn poll(&self, _key: &ServerKey) -> ProcessStatus {
            ProcessStatus::Exited(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_removes_orphan_route_and_stops_on_cancel() {
        let proxy = Arc::new(InMemoryProxy::new());
        proxy
            .put_route("/user/ghost/", "http://127.0.0.1:1")
            .await
            .unwrap();
        proxy.put_route("/services/x/", "http://127.0.0.1:2").await.unwrap();

        let orchestrator = Arc::new(
            Orchestrator::builder(HubConfig::default(), Arc::new(NoDriver), proxy.clone()).build(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_route_check(
            orchestrator,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(proxy.get("/user/ghost/"), None);
        // unmanaged routes are left alone
        assert!(proxy.get("/services/x/").is_some());

        cancel.cancel();
        task.await.unwrap();
    }
}
