//! Process driver trait

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;
use crate::types::{ProcessStatus, ProgressEvent, ServerKey, ServerOptions};

/// Starts, polls and stops the concrete process behind a server.
///
/// One driver serves every record of a deployment; calls are keyed by
/// [`ServerKey`]. The orchestrator never issues two concurrent calls for the
/// same key.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Start the process and return the URL it serves on.
    ///
    /// `cancel` fires when the spawn is superseded by a stop. Implementations
    /// should check it at convenient checkpoints and return
    /// [`DriverError::Cancelled`]; if the process came up anyway, returning
    /// `Ok` is fine, the orchestrator tears it down immediately.
    async fn start(
        &self,
        key: &ServerKey,
        options: &ServerOptions,
        cancel: CancellationToken,
    ) -> Result<String, DriverError>;

    /// Stop the process. Stopping an absent process must succeed.
    async fn stop(&self, key: &ServerKey) -> Result<(), DriverError>;

    /// Current liveness, without suspending
    fn poll(&self, key: &ServerKey) -> ProcessStatus;

    /// Progress reports for an in-flight start.
    ///
    /// Called once per spawn attempt, just before `start`. `None` selects the
    /// built-in fallback sequence.
    fn progress(&self, _key: &ServerKey) -> Option<BoxStream<'static, ProgressEvent>> {
        None
    }
}
