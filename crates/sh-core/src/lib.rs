//! sh-core: Core abstractions and configuration for spawnhub
//!
//! This crate provides the shared domain types, the collaborator traits the
//! orchestrator drives (process driver, proxy backend, record store), the
//! error taxonomy and configuration loading.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{HubError, ServerError};
pub use types::{ServerKey, ServerSnapshot, ServerState};
