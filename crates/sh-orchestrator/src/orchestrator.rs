//! Registry of server records and the entry point for the API layer
//!
//! The [`Orchestrator`] owns every [`Server`] keyed by (user, server-name),
//! creates records lazily on first reference, and routes spawn, stop,
//! progress and activity requests to them. It is the only component the API
//! layer talks to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use sh_core::config::HubConfig;
use sh_core::error::{CounterKind, HubError, ProxyError, ServerError};
use sh_core::time::{current_time_millis, is_idle};
use sh_core::traits::{ProcessDriver, ProxyBackend, RecordStore};
use sh_core::types::{RouteEntry, ServerKey, ServerOptions, ServerSnapshot, ServerState};

use crate::admission::{AdmissionController, AdmissionCounts};
use crate::lifecycle::{
    LifecycleContext, ReadyHook, RouteSync, Server, StartOutcome, StopOutcome,
};
use crate::progress::ProgressStream;
use crate::proxy::{ProxySynchronizer, ReconcileReport};
use crate::store::InMemoryStore;

/// Server totals across the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounts {
    /// Servers with a spawn or stop in flight
    pub pending: usize,
    /// Servers that are pending or running
    pub active: usize,
    /// Servers that are running
    pub ready: usize,
    /// Admission counter values
    pub admission: AdmissionCounts,
}

/// Builds an [`Orchestrator`] from configuration and collaborators
pub struct OrchestratorBuilder {
    config: HubConfig,
    driver: Arc<dyn ProcessDriver>,
    proxy: Arc<dyn ProxyBackend>,
    store: Option<Arc<dyn RecordStore>>,
    ready_hook: Option<ReadyHook>,
}

impl OrchestratorBuilder {
    /// Use a durable record store (default: in memory)
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Rewrite ready events before they reach progress readers
    pub fn ready_hook(mut self, hook: ReadyHook) -> Self {
        self.ready_hook = Some(hook);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Orchestrator {
        let ctx = LifecycleContext {
            driver: self.driver,
            proxy: Arc::new(ProxySynchronizer::new(self.proxy, self.config.base_url.clone())),
            admission: Arc::new(AdmissionController::from_config(&self.config)),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            start_timeout: self.config.start_timeout,
            stop_timeout: self.config.stop_timeout,
            ready_hook: self.ready_hook,
        };
        Orchestrator {
            config: self.config,
            ctx: Arc::new(ctx),
            servers: DashMap::new(),
        }
    }
}

/// Top-level façade over the lifecycle core
pub struct Orchestrator {
    config: HubConfig,
    ctx: Arc<LifecycleContext>,
    /// Records indexed by (user, server-name)
    servers: DashMap<ServerKey, Arc<Server>>,
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder(
        config: HubConfig,
        driver: Arc<dyn ProcessDriver>,
        proxy: Arc<dyn ProxyBackend>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            driver,
            proxy,
            store: None,
            ready_hook: None,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The proxy synchronizer
    pub fn proxy(&self) -> &Arc<ProxySynchronizer> {
        &self.ctx.proxy
    }

    /// The admission controller
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.ctx.admission
    }

    /// Get or lazily create the record for `key`
    async fn server(&self, key: &ServerKey) -> Result<Arc<Server>, HubError> {
        if let Some(server) = self.servers.get(key) {
            return Ok(Arc::clone(&server));
        }
        let stored = self.ctx.store.load(key).await?;
        let server = self
            .servers
            .entry(key.clone())
            .or_insert_with(|| Server::new(key.clone(), Arc::clone(&self.ctx), stored));
        Ok(Arc::clone(&server))
    }

    /// Existing record for `key`, from the registry or the store
    async fn lookup(&self, key: &ServerKey) -> Result<Arc<Server>, ServerError> {
        if let Some(server) = self.servers.get(key) {
            return Ok(Arc::clone(&server));
        }
        match self.ctx.store.load(key).await {
            Ok(Some(stored)) => {
                let server = self.servers.entry(key.clone()).or_insert_with(|| {
                    Server::new(key.clone(), Arc::clone(&self.ctx), Some(stored))
                });
                Ok(Arc::clone(&server))
            }
            Ok(None) => Err(ServerError::NotFound(key.clone())),
            Err(e) => {
                tracing::warn!("Failed to load {} from store: {}", key, e);
                Err(ServerError::NotFound(key.clone()))
            }
        }
    }

    /// Request a spawn of `user`'s server `name`.
    ///
    /// `options` of `None` reuses the options of the previous spawn.
    pub async fn request_spawn(
        &self,
        user: &str,
        name: &str,
        options: Option<ServerOptions>,
    ) -> Result<StartOutcome, ServerError> {
        let key = ServerKey::new(user, name);
        let server = self.server(&key).await.map_err(|e| {
            tracing::error!("Failed to load record for {}: {}", key, e);
            ServerError::DriverFailure(e.to_string())
        })?;
        server.start(options).await
    }

    /// Request a stop of `user`'s server `name`
    pub async fn request_stop(&self, user: &str, name: &str) -> Result<StopOutcome, ServerError> {
        let server = self.lookup(&ServerKey::new(user, name)).await?;
        Ok(server.stop().await)
    }

    /// Current state of `user`'s server `name`
    pub async fn get_state(&self, user: &str, name: &str) -> Result<ServerSnapshot, ServerError> {
        Ok(self.lookup(&ServerKey::new(user, name)).await?.poll())
    }

    /// Progress of the current spawn of `user`'s server `name`.
    ///
    /// `NotFound` if there is no record or the server is stopped or stopping.
    pub async fn subscribe_progress(
        &self,
        user: &str,
        name: &str,
    ) -> Result<ProgressStream, ServerError> {
        let key = ServerKey::new(user, name);
        let server = self.lookup(&key).await?;
        server.progress().await.ok_or(ServerError::NotFound(key))
    }

    /// Report activity on `user`'s server `name`.
    ///
    /// Timestamps older than the stored one are ignored.
    pub async fn record_activity(
        &self,
        user: &str,
        name: &str,
        timestamp: u64,
    ) -> Result<(), ServerError> {
        let server = self.lookup(&ServerKey::new(user, name)).await?;
        server.record_activity(timestamp).await;
        Ok(())
    }

    /// Most recent activity over all of `user`'s servers
    pub fn user_last_activity(&self, user: &str) -> Option<u64> {
        self.servers
            .iter()
            .filter(|r| r.key().user == user)
            .filter_map(|r| r.value().poll().last_activity)
            .max()
    }

    /// Snapshots of all of `user`'s servers, sorted by name
    pub fn list_servers(&self, user: &str) -> Vec<ServerSnapshot> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .filter(|r| r.key().user == user)
            .map(|r| r.value().poll())
            .collect();
        servers.sort_by(|a, b| a.key.cmp(&b.key));
        servers
    }

    /// Running servers whose last activity is older than `idle_for`
    pub fn idle_servers(&self, idle_for: Duration) -> Vec<ServerSnapshot> {
        let now = current_time_millis();
        let mut idle: Vec<_> = self
            .snapshots()
            .into_iter()
            .filter(|s| s.is_running() && is_idle(s.last_activity, idle_for, now))
            .collect();
        idle.sort_by_key(|s| s.last_activity);
        idle
    }

    fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.servers.iter().map(|r| r.value().poll()).collect()
    }

    /// Server totals and admission counters
    pub fn counts(&self) -> ServerCounts {
        let mut counts = ServerCounts {
            admission: self.ctx.admission.counts(),
            ..Default::default()
        };
        for snapshot in self.snapshots() {
            match snapshot.state {
                ServerState::PendingSpawn | ServerState::PendingStop => {
                    counts.pending += 1;
                    counts.active += 1;
                }
                ServerState::Running => {
                    counts.ready += 1;
                    counts.active += 1;
                }
                ServerState::Stopped | ServerState::Failed => {}
            }
        }
        counts
    }

    /// Routes the proxy should hold right now
    pub fn expected_routes(&self) -> Vec<RouteEntry> {
        let mut routes: Vec<_> = self
            .snapshots()
            .into_iter()
            .filter_map(|s| {
                let url = s.url.as_deref().filter(|_| s.is_running())?;
                Some(self.ctx.proxy.route_for(&s.key, url))
            })
            .collect();
        routes.sort();
        routes
    }

    /// Bring the proxy in line with the registry.
    ///
    /// Each record's route is checked under that record's lock so the check
    /// never races a spawn or stop. Managed routes with no record are removed.
    pub async fn check_routes(&self) -> Result<ReconcileReport, ProxyError> {
        let current: std::collections::HashMap<String, String> = self
            .ctx
            .proxy
            .routes()
            .await?
            .into_iter()
            .map(|r| (r.path_prefix, r.target_url))
            .collect();

        let servers: Vec<Arc<Server>> =
            self.servers.iter().map(|r| Arc::clone(r.value())).collect();
        let mut known = HashSet::new();
        let mut report = ReconcileReport::default();

        for server in servers {
            let path = self.ctx.proxy.route_path(server.key());
            let target = current.get(&path).map(String::as_str);
            match server.sync_route(target).await {
                Ok(RouteSync::Unchanged) => {}
                Ok(RouteSync::Added) | Ok(RouteSync::Updated) => {
                    if let Some(url) = server.poll().url {
                        let route = RouteEntry::new(path.clone(), url);
                        if target.is_some() {
                            report.updated.push(route);
                        } else {
                            report.added.push(route);
                        }
                    }
                }
                Ok(RouteSync::Removed) => report.removed.push(path.clone()),
                Err(e) => {
                    tracing::warn!("Route check failed for {}: {}", server.key(), e);
                    report.failed += 1;
                }
            }
            known.insert(path);
        }

        for path in current.keys().filter(|p| !known.contains(*p)) {
            tracing::warn!("Removing route {} with no server record", path);
            match self.ctx.proxy.remove(path).await {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => {
                    tracing::warn!("Failed to remove orphan route {}: {}", path, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Rebuild the registry from the store after a restart.
    ///
    /// Records that were running are polled through the driver: live ones
    /// come back running with a fresh active slot, dead ones come back
    /// stopped. The proxy is then reconciled to the running set.
    pub async fn restore(&self) -> Result<ReconcileReport, HubError> {
        let records = self.ctx.store.load_all().await?;
        tracing::info!("Restoring {} server records", records.len());

        for mut record in records {
            let key = record.key.clone();
            let was_running = record.url.is_some();
            let alive = was_running && self.ctx.driver.poll(&key).is_running();

            let ticket = if alive {
                match self.ctx.admission.try_reserve(CounterKind::Active) {
                    Ok(ticket) => Some(ticket),
                    Err(e) => {
                        tracing::warn!("Cannot readmit {}: {}; stopping it", key, e);
                        if let Err(e) = self.ctx.driver.stop(&key).await {
                            tracing::warn!("Failed to stop {}: {}", key, e);
                        }
                        None
                    }
                }
            } else {
                None
            };

            if was_running && ticket.is_none() {
                tracing::info!("{} is no longer running", key);
                record.url = None;
                record.started_at = None;
                if let Err(e) = self.ctx.store.save(&record).await {
                    tracing::warn!("Failed to persist {}: {}", key, e);
                }
            }

            let server = Server::restored(Arc::clone(&self.ctx), record, ticket);
            self.servers.insert(key, server);
        }

        let report = self.ctx.proxy.reconcile(&self.expected_routes()).await?;
        tracing::info!(
            "Proxy reconciled: {} added, {} updated, {} removed",
            report.added.len(),
            report.updated.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Stop and forget every server of `user`.
    ///
    /// Each record is retired before it is stopped, so a spawn racing the
    /// deletion is rejected instead of outliving its record.
    pub async fn delete_user(&self, user: &str) -> Result<(), HubError> {
        let servers: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter(|r| r.key().user == user)
            .map(|r| Arc::clone(r.value()))
            .collect();

        for server in &servers {
            if let StopOutcome::Accepted(operation) = server.retire().await {
                operation.wait().await;
            }
        }
        let deleted = self.ctx.store.delete_user(user).await;
        for server in &servers {
            self.servers
                .remove_if(server.key(), |_, current| Arc::ptr_eq(current, server));
        }
        deleted?;
        tracing::info!("Deleted user {} ({} servers)", user, servers.len());
        Ok(())
    }

    /// Stop every server and wait for all of them to settle
    pub async fn stop_all(&self) {
        let servers: Vec<Arc<Server>> =
            self.servers.iter().map(|r| Arc::clone(r.value())).collect();
        let operations = futures::future::join_all(servers.iter().map(|s| s.stop())).await;
        let waits = operations.into_iter().filter_map(|outcome| match outcome {
            StopOutcome::Accepted(operation) => Some(async move { operation.wait().await }),
            StopOutcome::AlreadyStopped => None,
        });
        let results = futures::future::join_all(waits).await;
        tracing::info!("Stopped {} servers", results.len());
    }

    /// Number of records in the registry
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
