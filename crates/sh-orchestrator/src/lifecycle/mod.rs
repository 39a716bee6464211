//! Per-server lifecycle state machine
//!
//! Each (user, server-name) pair gets one [`Server`]. It owns the record's
//! state and drives spawn and stop operations against the process driver,
//! taking admission tickets, keeping the proxy route in step with the state,
//! and feeding the progress channel of the current spawn.
//!
//! ```text
//! stopped ──start──▶ pending_spawn ──ok──▶ running ──stop──▶ pending_stop ──▶ stopped
//!    ▲                    │  │                                   ▲
//!    │                    │  └──────────────stop (cancel)────────┘
//!    └──start── failed ◀──┘ driver failure / timeout
//! ```

mod operation;
mod server;

use std::sync::Arc;
use std::time::Duration;

use sh_core::traits::{ProcessDriver, RecordStore};
use sh_core::types::{ProgressEvent, ServerKey};

use crate::admission::AdmissionController;
use crate::proxy::ProxySynchronizer;

pub use operation::{LifecycleOperation, OperationResult};
pub use server::{RouteSync, Server, StartOutcome, StopOutcome};

/// Deployment hook that may rewrite the ready event of a spawn.
///
/// An error falls back to the default ready event.
pub type ReadyHook =
    Arc<dyn Fn(&ServerKey, ProgressEvent) -> anyhow::Result<ProgressEvent> + Send + Sync>;

/// Collaborators and limits shared by every [`Server`]
pub struct LifecycleContext {
    /// Starts and stops processes
    pub driver: Arc<dyn ProcessDriver>,
    /// Keeps proxy routes in step with server state
    pub proxy: Arc<ProxySynchronizer>,
    /// Global admission counters
    pub admission: Arc<AdmissionController>,
    /// Durable record storage
    pub store: Arc<dyn RecordStore>,
    /// Ceiling on a single spawn
    pub start_timeout: Duration,
    /// Ceiling on a single stop
    pub stop_timeout: Duration,
    /// Optional ready-event rewrite
    pub ready_hook: Option<ReadyHook>,
}

impl LifecycleContext {
    /// Ready event for `key` at `url`, passed through the hook if one is set
    pub fn ready_event(&self, key: &ServerKey, url: &str) -> ProgressEvent {
        let event = ProgressEvent::ready(url);
        let Some(hook) = &self.ready_hook else {
            return event;
        };
        match hook(key, event.clone()) {
            Ok(mut custom) => {
                custom.progress = ProgressEvent::COMPLETE;
                custom.ready = Some(true);
                custom
            }
            Err(e) => {
                tracing::warn!("Ready hook failed for {}: {:#}", key, e);
                event
            }
        }
    }
}
