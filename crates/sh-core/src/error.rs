//! Core error types for spawnhub

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ServerKey, ServerState};

/// Top-level error type for the spawnhub ecosystem
#[derive(Error, Debug)]
pub enum HubError {
    /// Server lifecycle error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Process driver error
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Proxy error
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Outcomes of lifecycle requests that the caller is expected to branch on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Operation not valid in the current state
    #[error("{key} is {state}, cannot proceed")]
    Conflict {
        /// Server the request was for
        key: ServerKey,
        /// State that blocked the request
        state: ServerState,
    },

    /// Admission rejected; retry later
    #[error("Too many {0} servers, try again later")]
    CapacityExceeded(CounterKind),

    /// The process failed to start or stop
    #[error("{0}")]
    DriverFailure(String),

    /// No such record
    #[error("No such server: {0}")]
    NotFound(ServerKey),
}

impl ServerError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerError::CapacityExceeded(_))
    }
}

/// Global admission counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Concurrent in-flight spawns
    Spawning,
    /// Concurrently running servers
    Active,
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterKind::Spawning => write!(f, "pending"),
            CounterKind::Active => write!(f, "active"),
        }
    }
}

/// Errors reported by a process driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The process could not be started or stopped
    #[error("{0}")]
    Failed(String),

    /// The call observed its cancellation token and aborted
    #[error("Operation cancelled")]
    Cancelled,

    /// The call exceeded its ceiling
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors reported by a proxy backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// The route does not exist
    #[error("Route not found: {0}")]
    NotFound(String),

    /// Any other backend failure
    #[error("Proxy backend error: {0}")]
    Backend(String),
}

/// Errors reported by a record store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_capacity_is_retryable() {
        assert!(ServerError::CapacityExceeded(CounterKind::Spawning).is_retryable());
        assert!(!ServerError::DriverFailure("boom".into()).is_retryable());
        assert!(!ServerError::NotFound(ServerKey::default_server("x")).is_retryable());
    }

    #[test]
    fn test_conflict_message() {
        let err = ServerError::Conflict {
            key: ServerKey::new("panda", "lab"),
            state: ServerState::PendingStop,
        };
        assert_eq!(err.to_string(), "panda/lab is pending_stop, cannot proceed");
    }
}
