//! Admission control for spawning and active servers
//!
//! Two process-wide counters gate how many servers may be mid-spawn and how
//! many may be active at once. A reservation is an [`AdmissionTicket`]; the
//! slot is returned when the ticket is dropped, so every path out of an
//! operation (success, failure, cancellation, panic) releases it exactly once.
//!
//! Reservation never waits. A full counter rejects immediately and the caller
//! turns that into a retryable "capacity exceeded" response.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sh_core::config::HubConfig;
use sh_core::error::{CounterKind, ServerError};

/// One bounded (or unbounded) counter
struct Counter {
    kind: CounterKind,
    limit: Option<usize>,
    in_use: AtomicUsize,
}

impl Counter {
    fn new(kind: CounterKind, limit: Option<usize>) -> Self {
        Self {
            kind,
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take one slot if below the limit
    fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match self.limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            })
            .is_ok()
    }

    fn release(&self) {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "{:?} counter released below zero", self.kind);
    }
}

/// Reservation against one admission counter.
///
/// Not `Clone`: exactly one owner, released exactly once on drop.
pub struct AdmissionTicket {
    counter: Arc<Counter>,
}

impl AdmissionTicket {
    /// Counter this ticket reserves against
    pub fn kind(&self) -> CounterKind {
        self.counter.kind
    }
}

impl fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("kind", &self.counter.kind)
            .finish()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.counter.release();
        tracing::trace!("Released {} admission slot", self.counter.kind);
    }
}

/// Current counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionCounts {
    /// Spawns in flight
    pub spawning: usize,
    /// Servers holding an active slot
    pub active: usize,
}

/// Process-wide admission counters.
///
/// Constructed explicitly and injected, so independent instances can coexist
/// (one per orchestrator, one per test).
pub struct AdmissionController {
    spawning: Arc<Counter>,
    active: Arc<Counter>,
}

impl AdmissionController {
    /// Create a controller; `None` disables a limit
    pub fn new(spawn_limit: Option<usize>, active_limit: Option<usize>) -> Self {
        Self {
            spawning: Arc::new(Counter::new(CounterKind::Spawning, spawn_limit)),
            active: Arc::new(Counter::new(CounterKind::Active, active_limit)),
        }
    }

    /// Create a controller from configuration
    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.spawn_limit(), config.active_limit())
    }

    /// A controller with no limits
    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    fn counter(&self, kind: CounterKind) -> &Arc<Counter> {
        match kind {
            CounterKind::Spawning => &self.spawning,
            CounterKind::Active => &self.active,
        }
    }

    /// Reserve one slot, or reject with [`ServerError::CapacityExceeded`]
    pub fn try_reserve(&self, kind: CounterKind) -> Result<AdmissionTicket, ServerError> {
        let counter = self.counter(kind);
        if counter.try_acquire() {
            Ok(AdmissionTicket {
                counter: Arc::clone(counter),
            })
        } else {
            tracing::debug!(
                "Admission rejected: {} limit of {:?} reached",
                kind,
                counter.limit
            );
            Err(ServerError::CapacityExceeded(kind))
        }
    }

    /// Configured limit for a counter
    pub fn limit(&self, kind: CounterKind) -> Option<usize> {
        self.counter(kind).limit
    }

    /// Snapshot of both counters
    pub fn counts(&self) -> AdmissionCounts {
        AdmissionCounts {
            spawning: self.spawning.in_use.load(Ordering::Acquire),
            active: self.active.in_use.load(Ordering::Acquire),
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::unbounded()
    }
}
