//! Handles to in-flight spawn and stop operations

use std::fmt;

use tokio::sync::watch;

use sh_core::types::{OperationKind, ServerKey};

/// Terminal outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// The operation reached its target state
    Succeeded,
    /// The driver reported a failure
    Failed(String),
    /// A spawn was superseded by a stop
    Cancelled,
}

impl OperationResult {
    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Succeeded)
    }
}

/// Observer handle for one spawn or stop attempt.
///
/// Cloning is cheap; every clone observes the same eventual result. The
/// handle refers to its record by key only.
#[derive(Clone)]
pub struct LifecycleOperation {
    key: ServerKey,
    kind: OperationKind,
    attempt: u64,
    result: watch::Receiver<Option<OperationResult>>,
}

impl LifecycleOperation {
    /// Record this operation belongs to
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Spawn or stop
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Per-record attempt number
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Result if already settled, without waiting
    pub fn result(&self) -> Option<OperationResult> {
        self.result.borrow().clone()
    }

    /// Wait for the operation to settle
    pub async fn wait(&self) -> OperationResult {
        let mut rx = self.result.clone();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| {
            OperationResult::Failed(format!("{} of {} ended without a result", self.kind, self.key))
        })
    }
}

impl fmt::Debug for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleOperation")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("attempt", &self.attempt)
            .field("result", &*self.result.borrow())
            .finish()
    }
}

/// Write side of a [`LifecycleOperation`], owned by the task running it
pub(crate) struct OperationCompleter {
    tx: watch::Sender<Option<OperationResult>>,
}

impl OperationCompleter {
    /// Publish the result. Only the first call counts.
    pub(crate) fn complete(&self, result: OperationResult) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }
}

/// Create a new operation and its completer
pub(crate) fn new_operation(
    key: ServerKey,
    kind: OperationKind,
    attempt: u64,
) -> (LifecycleOperation, OperationCompleter) {
    let (tx, result) = watch::channel(None);
    (
        LifecycleOperation {
            key,
            kind,
            attempt,
            result,
        },
        OperationCompleter { tx },
    )
}
