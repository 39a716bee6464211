//! State machine for one server record

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sh_core::error::{CounterKind, DriverError, ProxyError, ServerError};
use sh_core::time::{advance_activity, current_time_millis};
use sh_core::types::{
    OperationKind, ProgressEvent, ServerKey, ServerOptions, ServerSnapshot, ServerState,
    StoredRecord,
};

use super::operation::{new_operation, LifecycleOperation, OperationCompleter, OperationResult};
use super::LifecycleContext;
use crate::admission::AdmissionTicket;
use crate::progress::{ProgressChannel, ProgressStream};

/// Response to a start request
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A spawn is in flight (new, or the one already pending)
    Accepted(LifecycleOperation),
    /// The server was already running
    AlreadyRunning,
}

/// Response to a stop request
#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// A stop is in flight (new, or the one already pending)
    Accepted(LifecycleOperation),
    /// Nothing was running
    AlreadyStopped,
}

/// What a route check did for one server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSync {
    /// The table already matched the state
    Unchanged,
    /// A missing route was added
    Added,
    /// A route pointing at the wrong target was replaced
    Updated,
    /// A route for a server that is not running was removed
    Removed,
}

/// The in-flight spawn, exclusively owned by the record while pending
struct PendingSpawn {
    operation: LifecycleOperation,
    cancel: CancellationToken,
    task: JoinHandle<SpawnExit>,
}

/// What a superseded spawn hands over to the stop that replaced it
#[derive(Default)]
struct SpawnExit {
    /// Set if the driver started the process despite the cancellation
    started_url: Option<String>,
    /// Active slot still held for the process
    active_ticket: Option<AdmissionTicket>,
}

struct SpawnAttempt {
    attempt: u64,
    options: ServerOptions,
    cancel: CancellationToken,
    progress: Arc<ProgressChannel>,
    completer: OperationCompleter,
    spawning_ticket: AdmissionTicket,
    active_ticket: AdmissionTicket,
}

struct StopAttempt {
    spawn_task: Option<JoinHandle<SpawnExit>>,
    active_ticket: Option<AdmissionTicket>,
    was_running: bool,
    /// Route whose removal failed when the stop was requested
    stale_route: Option<String>,
    completer: OperationCompleter,
}

struct ServerInner {
    record: ServerSnapshot,
    /// Bumped for every spawn or stop issued
    attempt: u64,
    spawn: Option<PendingSpawn>,
    stop: Option<LifecycleOperation>,
    /// Held while running
    active_ticket: Option<AdmissionTicket>,
    /// Channel of the current or most recent spawn
    progress: Option<Arc<ProgressChannel>>,
    /// Set once the owning user is being deleted; no further spawns
    retired: bool,
}

/// One named server belonging to one user.
///
/// All transitions happen under the record's lock, so operations on a record
/// are totally ordered. Driver start/stop calls run in their own tasks without
/// the lock; the stop task waits for a superseded spawn task before calling
/// the driver, so two driver calls for one record never overlap.
pub struct Server {
    key: ServerKey,
    ctx: Arc<LifecycleContext>,
    inner: Mutex<ServerInner>,
    snapshot: watch::Sender<ServerSnapshot>,
}

impl Server {
    /// Create a stopped record, seeded from a stored one if present
    pub fn new(
        key: ServerKey,
        ctx: Arc<LifecycleContext>,
        stored: Option<StoredRecord>,
    ) -> Arc<Self> {
        let mut record = ServerSnapshot::stopped(key.clone());
        if let Some(stored) = stored {
            record.options = stored.options;
            record.last_activity = stored.last_activity;
        }
        Self::with_record(ctx, record, None)
    }

    /// Rebuild a record after a restart.
    ///
    /// With an active ticket and a stored URL the record comes back running;
    /// otherwise it comes back stopped.
    pub fn restored(
        ctx: Arc<LifecycleContext>,
        stored: StoredRecord,
        active_ticket: Option<AdmissionTicket>,
    ) -> Arc<Self> {
        let mut record = ServerSnapshot::stopped(stored.key.clone());
        record.options = stored.options;
        record.last_activity = stored.last_activity;

        let active_ticket = match (stored.url, active_ticket) {
            (Some(url), Some(ticket)) => {
                record.state = ServerState::Running;
                record.url = Some(url);
                record.started_at = stored.started_at;
                Some(ticket)
            }
            _ => None,
        };
        Self::with_record(ctx, record, active_ticket)
    }

    fn with_record(
        ctx: Arc<LifecycleContext>,
        record: ServerSnapshot,
        active_ticket: Option<AdmissionTicket>,
    ) -> Arc<Self> {
        let (snapshot, _) = watch::channel(record.clone());
        Arc::new(Self {
            key: record.key.clone(),
            ctx,
            inner: Mutex::new(ServerInner {
                record,
                attempt: 0,
                spawn: None,
                stop: None,
                active_ticket,
                progress: None,
                retired: false,
            }),
            snapshot,
        })
    }

    /// Record identity
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Current state, without waiting or side effects
    pub fn poll(&self) -> ServerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ServerSnapshot> {
        self.snapshot.subscribe()
    }

    /// Wait until no operation is pending
    pub async fn settled(&self) -> ServerSnapshot {
        let mut rx = self.snapshot.subscribe();
        if let Ok(snapshot) = rx.wait_for(|s| !s.state.is_pending()).await {
            return snapshot.clone();
        }
        self.poll()
    }

    fn publish(&self, inner: &ServerInner) {
        self.snapshot.send_replace(inner.record.clone());
    }

    /// Save the record. Callers hold the record lock so saves land in
    /// transition order.
    async fn persist(&self, inner: &ServerInner) {
        let record = StoredRecord::from(&inner.record);
        if let Err(e) = self.ctx.store.save(&record).await {
            tracing::warn!("Failed to persist {}: {}", self.key, e);
        }
    }

    /// Request a spawn.
    ///
    /// Running: nothing to do. Pending spawn: the existing operation is
    /// returned and the driver is not called again. Pending stop: conflict.
    /// Otherwise both admission tickets are reserved up front and a new spawn
    /// is dispatched. A retired record rejects every spawn.
    pub async fn start(
        self: &Arc<Self>,
        options: Option<ServerOptions>,
    ) -> Result<StartOutcome, ServerError> {
        let mut inner = self.inner.lock().await;
        if inner.retired {
            return Err(ServerError::NotFound(self.key.clone()));
        }

        match inner.record.state {
            ServerState::Running => return Ok(StartOutcome::AlreadyRunning),
            ServerState::PendingStop => {
                return Err(ServerError::Conflict {
                    key: self.key.clone(),
                    state: ServerState::PendingStop,
                })
            }
            ServerState::PendingSpawn => {
                if let Some(spawn) = &inner.spawn {
                    tracing::debug!("Spawn of {} already pending, joining it", self.key);
                    return Ok(StartOutcome::Accepted(spawn.operation.clone()));
                }
                tracing::warn!("{} pending spawn without a handle, respawning", self.key);
            }
            ServerState::Stopped | ServerState::Failed => {}
        }

        let spawning_ticket = self.ctx.admission.try_reserve(CounterKind::Spawning)?;
        let active_ticket = self.ctx.admission.try_reserve(CounterKind::Active)?;

        if let Some(options) = options {
            inner.record.options = options;
        }
        inner.attempt += 1;
        let attempt = inner.attempt;
        let (operation, completer) = new_operation(self.key.clone(), OperationKind::Spawn, attempt);
        let cancel = CancellationToken::new();
        let progress = ProgressChannel::new();

        inner.record.state = ServerState::PendingSpawn;
        inner.record.url = None;
        inner.record.started_at = None;
        inner.record.failure = None;
        inner.progress = Some(Arc::clone(&progress));

        let task = tokio::spawn(Arc::clone(self).run_spawn(SpawnAttempt {
            attempt,
            options: inner.record.options.clone(),
            cancel: cancel.clone(),
            progress,
            completer,
            spawning_ticket,
            active_ticket,
        }));
        inner.spawn = Some(PendingSpawn {
            operation: operation.clone(),
            cancel,
            task,
        });
        self.publish(&inner);
        self.persist(&inner).await;
        drop(inner);

        tracing::info!("Spawning {} (attempt {})", self.key, attempt);
        Ok(StartOutcome::Accepted(operation))
    }

    async fn run_spawn(self: Arc<Self>, attempt: SpawnAttempt) -> SpawnExit {
        let SpawnAttempt {
            attempt,
            options,
            cancel,
            progress,
            completer,
            spawning_ticket,
            active_ticket,
        } = attempt;

        let producer = self
            .ctx
            .driver
            .progress(&self.key)
            .unwrap_or_else(ProgressChannel::fallback_sequence);
        tokio::spawn(Arc::clone(&progress).pump(producer));

        let started = match tokio::time::timeout(
            self.ctx.start_timeout,
            self.ctx.driver.start(&self.key, &options, cancel.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    "{} did not start within {:?}, stopping it",
                    self.key,
                    self.ctx.start_timeout
                );
                if let Err(e) = self.stop_process().await {
                    tracing::warn!("Cleanup stop of {} failed: {}", self.key, e);
                }
                Err(DriverError::Timeout(self.ctx.start_timeout))
            }
        };

        let mut inner = self.inner.lock().await;

        let superseded = inner
            .spawn
            .as_ref()
            .map_or(true, |spawn| spawn.operation.attempt() != attempt);
        if superseded {
            drop(inner);
            drop(spawning_ticket);
            tracing::info!("Spawn of {} (attempt {}) was cancelled", self.key, attempt);
            progress.finish(ProgressEvent::failed("Spawn cancelled"));
            completer.complete(OperationResult::Cancelled);
            return SpawnExit {
                started_url: started.ok(),
                active_ticket: Some(active_ticket),
            };
        }

        let url = match started {
            Ok(url) => url,
            Err(e) => {
                let reason = e.to_string();
                drop(spawning_ticket);
                drop(active_ticket);
                self.fail_spawn(&mut inner, &reason, &progress, &completer).await;
                return SpawnExit::default();
            }
        };

        let route = self.ctx.proxy.route_for(&self.key, &url);
        if let Err(e) = self.ctx.proxy.add(&route).await {
            let reason = format!("Failed to add route {}: {}", route.path_prefix, e);
            if let Err(e) = self.stop_process().await {
                tracing::warn!("Cleanup stop of {} failed: {}", self.key, e);
            }
            drop(spawning_ticket);
            drop(active_ticket);
            self.fail_spawn(&mut inner, &reason, &progress, &completer).await;
            return SpawnExit::default();
        }

        let now = current_time_millis();
        inner.record.state = ServerState::Running;
        inner.record.url = Some(url.clone());
        inner.record.started_at = Some(now);
        advance_activity(&mut inner.record.last_activity, now);
        inner.spawn = None;
        inner.active_ticket = Some(active_ticket);
        drop(spawning_ticket);
        self.publish(&inner);
        self.persist(&inner).await;
        drop(inner);

        tracing::info!("{} is running at {}", self.key, url);
        progress.finish(self.ctx.ready_event(&self.key, &url));
        completer.complete(OperationResult::Succeeded);
        SpawnExit::default()
    }

    async fn fail_spawn(
        &self,
        inner: &mut ServerInner,
        reason: &str,
        progress: &ProgressChannel,
        completer: &OperationCompleter,
    ) {
        tracing::warn!("Spawn of {} failed: {}", self.key, reason);
        inner.record.state = ServerState::Failed;
        inner.record.url = None;
        inner.record.failure = Some(reason.to_string());
        inner.spawn = None;
        self.publish(inner);
        self.persist(inner).await;
        progress.finish(ProgressEvent::failed(reason));
        completer.complete(OperationResult::Failed(reason.to_string()));
    }

    /// Request a stop.
    ///
    /// Stopped or failed: nothing to do. Pending stop: the existing operation
    /// is returned. Pending spawn: the spawn is cancelled and the stop takes
    /// over once it has unwound. Running: the route is removed before the
    /// stop is dispatched. Stop never waits on admission.
    pub async fn stop(self: &Arc<Self>) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        let mut stale_route = None;

        let (spawn_task, active_ticket, was_running) = match inner.record.state {
            ServerState::Stopped | ServerState::Failed => return StopOutcome::AlreadyStopped,
            ServerState::PendingStop => {
                if let Some(operation) = inner.stop.clone() {
                    tracing::debug!("Stop of {} already pending, joining it", self.key);
                    return StopOutcome::Accepted(operation);
                }
                (None, inner.active_ticket.take(), false)
            }
            ServerState::PendingSpawn => match inner.spawn.take() {
                Some(spawn) => {
                    tracing::info!(
                        "Cancelling spawn of {} (attempt {})",
                        self.key,
                        spawn.operation.attempt()
                    );
                    spawn.cancel.cancel();
                    (Some(spawn.task), None, false)
                }
                None => (None, None, false),
            },
            ServerState::Running => {
                let path = self.ctx.proxy.route_path(&self.key);
                if let Err(e) = self.ctx.proxy.remove(&path).await {
                    tracing::warn!("Failed to remove route {} for {}: {}", path, self.key, e);
                    stale_route = Some(path);
                }
                (None, inner.active_ticket.take(), true)
            }
        };

        inner.attempt += 1;
        let (operation, completer) =
            new_operation(self.key.clone(), OperationKind::Stop, inner.attempt);
        inner.record.state = ServerState::PendingStop;
        inner.record.url = None;
        inner.stop = Some(operation.clone());
        tokio::spawn(Arc::clone(self).run_stop(StopAttempt {
            spawn_task,
            active_ticket,
            was_running,
            stale_route,
            completer,
        }));
        self.publish(&inner);
        drop(inner);

        tracing::info!("Stopping {}", self.key);
        StopOutcome::Accepted(operation)
    }

    /// Stop the server for good: later spawns are rejected with `NotFound`
    pub async fn retire(self: &Arc<Self>) -> StopOutcome {
        self.inner.lock().await.retired = true;
        self.stop().await
    }

    async fn run_stop(self: Arc<Self>, attempt: StopAttempt) {
        let StopAttempt {
            spawn_task,
            mut active_ticket,
            was_running,
            stale_route,
            completer,
        } = attempt;

        let mut alive = was_running;
        if let Some(task) = spawn_task {
            match task.await {
                Ok(exit) => {
                    if let Some(url) = &exit.started_url {
                        tracing::info!(
                            "Cancelled spawn of {} came up at {} anyway, tearing it down",
                            self.key,
                            url
                        );
                        alive = true;
                    }
                    if exit.active_ticket.is_some() {
                        active_ticket = exit.active_ticket;
                    }
                }
                Err(e) => {
                    tracing::warn!("Spawn task for {} ended abnormally: {}", self.key, e);
                }
            }
        }
        alive = alive || self.ctx.driver.poll(&self.key).is_running();

        let mut result = if alive {
            self.stop_process().await.map_err(|e| e.to_string())
        } else {
            Ok(())
        };

        let mut inner = self.inner.lock().await;
        // Retry the route removal; whatever is left is swept by the route check
        if let Some(path) = stale_route {
            if let Err(e) = self.ctx.proxy.remove(&path).await {
                result = result.and(Err(format!("Failed to remove route {}: {}", path, e)));
            }
        }
        inner.record.state = ServerState::Stopped;
        inner.record.url = None;
        inner.record.started_at = None;
        inner.stop = None;
        self.publish(&inner);
        self.persist(&inner).await;
        drop(inner);
        drop(active_ticket);

        match result {
            Ok(()) => {
                tracing::info!("{} stopped", self.key);
                completer.complete(OperationResult::Succeeded);
            }
            Err(reason) => {
                tracing::error!("Failed to stop {}: {}", self.key, reason);
                completer.complete(OperationResult::Failed(reason));
            }
        }
    }

    /// Driver stop bounded by the stop timeout
    async fn stop_process(&self) -> Result<(), DriverError> {
        match tokio::time::timeout(self.ctx.stop_timeout, self.ctx.driver.stop(&self.key)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.ctx.stop_timeout)),
        }
    }

    /// Progress of the current spawn.
    ///
    /// Pending spawn: a "requested" event, then the live channel from the
    /// reader's attach point on. Running or failed: the single terminal event.
    /// Stopped or stopping: `None`.
    pub async fn progress(&self) -> Option<ProgressStream> {
        let inner = self.inner.lock().await;
        let channel = inner.progress.clone();
        match inner.record.state {
            ServerState::PendingSpawn => {
                let channel = channel?;
                let requested = stream::once(async { ProgressEvent::requested() });
                Some(requested.chain(channel.subscribe()).boxed())
            }
            ServerState::Running => {
                let event = channel
                    .and_then(|c| c.terminal_event())
                    .filter(|e| e.ready == Some(true))
                    .or_else(|| {
                        let url = inner.record.url.as_deref()?;
                        Some(self.ctx.ready_event(&self.key, url))
                    })?;
                Some(stream::iter([event]).boxed())
            }
            ServerState::Failed => {
                let reason = inner.record.failure.as_deref().unwrap_or("unknown error");
                Some(stream::iter([ProgressEvent::failed(reason)]).boxed())
            }
            ServerState::Stopped | ServerState::PendingStop => None,
        }
    }

    /// Merge an activity report. Older reports are ignored.
    ///
    /// Returns true if the stored timestamp moved.
    pub async fn record_activity(&self, timestamp: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if !advance_activity(&mut inner.record.last_activity, timestamp) {
            tracing::trace!("Ignoring stale activity for {}", self.key);
            return false;
        }
        self.publish(&inner);
        self.persist(&inner).await;
        true
    }

    /// Make the proxy entry for this server match its state.
    ///
    /// Runs under the record lock so it never races a transition.
    pub async fn sync_route(&self, current_target: Option<&str>) -> Result<RouteSync, ProxyError> {
        let inner = self.inner.lock().await;
        let path = self.ctx.proxy.route_path(&self.key);

        match (inner.record.state, inner.record.url.as_deref()) {
            (ServerState::Running, Some(url)) => match current_target {
                Some(target) if target == url => Ok(RouteSync::Unchanged),
                existing => {
                    tracing::warn!("Restoring route {} -> {}", path, url);
                    self.ctx.proxy.add(&self.ctx.proxy.route_for(&self.key, url)).await?;
                    Ok(if existing.is_some() {
                        RouteSync::Updated
                    } else {
                        RouteSync::Added
                    })
                }
            },
            _ => match current_target {
                Some(_) => {
                    tracing::warn!("Removing route {} for {} server", path, inner.record.state);
                    self.ctx.proxy.remove(&path).await?;
                    Ok(RouteSync::Removed)
                }
                None => Ok(RouteSync::Unchanged),
            },
        }
    }
}
