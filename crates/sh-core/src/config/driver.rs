//! Local subprocess driver configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::duration_millis;

use crate::error::ConfigError;

/// How the local driver launches one server process.
///
/// Every `{port}` in `args` is replaced with the port chosen for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalDriverConfig {
    /// Program to run
    pub command: String,

    /// Arguments, with `{port}` substituted
    pub args: Vec<String>,

    /// Interface the process binds and the URL points at
    pub ip: String,

    /// Extra environment for every process
    pub env: HashMap<String, String>,

    /// Delay between readiness checks
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for LocalDriverConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "http.server".to_string(),
                "--bind".to_string(),
                "127.0.0.1".to_string(),
                "{port}".to_string(),
            ],
            ip: "127.0.0.1".to_string(),
            env: HashMap::new(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl LocalDriverConfig {
    /// Arguments with the port substituted
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }

    /// Reject an unusable launch command
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("driver.command must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "driver.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_substitution() {
        let config = LocalDriverConfig {
            args: vec!["--port={port}".into(), "serve".into()],
            ..Default::default()
        };
        assert_eq!(config.args_for_port(8123), vec!["--port=8123", "serve"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = LocalDriverConfig {
            command: "  ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
