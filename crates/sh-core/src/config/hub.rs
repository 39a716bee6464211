//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::LocalDriverConfig;
use crate::error::ConfigError;

/// Configuration for the spawnhub daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Maximum number of concurrent in-flight spawns (`None` or 0 = unbounded)
    pub concurrent_spawn_limit: Option<u32>,

    /// Maximum number of concurrently active servers (`None` or 0 = unbounded)
    pub active_server_limit: Option<u32>,

    /// Ceiling on a single spawn
    #[serde(with = "duration_secs")]
    pub start_timeout: Duration,

    /// Ceiling on a single stop
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,

    /// Interval between proxy route checks
    #[serde(with = "duration_secs")]
    pub route_check_interval: Duration,

    /// Prefix under which user routes live
    pub base_url: String,

    /// Settings for the local subprocess driver
    pub driver: LocalDriverConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            concurrent_spawn_limit: Some(100),
            active_server_limit: None,
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            route_check_interval: Duration::from_secs(30),
            base_url: "/".to_string(),
            driver: LocalDriverConfig::default(),
        }
    }
}

impl HubConfig {
    /// Spawn limit with 0 folded into "unbounded"
    pub fn spawn_limit(&self) -> Option<usize> {
        self.concurrent_spawn_limit
            .filter(|limit| *limit > 0)
            .map(|limit| limit as usize)
    }

    /// Active limit with 0 folded into "unbounded"
    pub fn active_limit(&self) -> Option<usize> {
        self.active_server_limit
            .filter(|limit| *limit > 0)
            .map(|limit| limit as usize)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_url.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_url must start with '/': {}",
                self.base_url
            )));
        }
        if self.start_timeout.is_zero() {
            return Err(ConfigError::Invalid("start_timeout must be positive".into()));
        }
        self.driver.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_means_unbounded() {
        let config = HubConfig {
            concurrent_spawn_limit: Some(0),
            active_server_limit: Some(3),
            ..Default::default()
        };
        assert_eq!(config.spawn_limit(), None);
        assert_eq!(config.active_limit(), Some(3));
    }

    #[test]
    fn test_validate_base_url() {
        let config = HubConfig {
            base_url: "hub/".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(HubConfig::default().validate().is_ok());
    }
}
