//! sh-orchestrator: Per-user server lifecycle daemon
//!
//! The orchestrator keeps one record per (user, server-name) pair and drives
//! it through spawn and stop against a pluggable process driver. It enforces
//! global admission limits, keeps the external proxy's routing table in line
//! with which servers are running, and streams spawn progress to any number
//! of readers.

pub mod admission;
pub mod driver;
pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod proxy;
pub mod store;

pub use admission::{AdmissionController, AdmissionCounts};
pub use lifecycle::{LifecycleOperation, OperationResult, StartOutcome, StopOutcome};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, ServerCounts};
pub use progress::ProgressStream;
