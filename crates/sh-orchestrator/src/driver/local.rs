//! Local subprocess driver
//!
//! Runs each server as a child process of the daemon. A free port is picked
//! for every start, substituted into the configured arguments, and the server
//! counts as started once something accepts TCP connections on that port.
//!
//! The child sees its identity through the environment:
//! - `SPAWNHUB_USER` and `SPAWNHUB_SERVER_NAME`
//! - `SPAWNHUB_PORT`
//! - `SPAWNHUB_OPTION_<KEY>` for every spawn option (strings as-is, other
//!   values as JSON)

use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sh_core::config::LocalDriverConfig;
use sh_core::error::DriverError;
use sh_core::traits::ProcessDriver;
use sh_core::types::{ProcessStatus, ProgressEvent, ServerKey, ServerOptions};

/// Prefix of every environment variable the driver sets
const ENV_PREFIX: &str = "SPAWNHUB_";

/// Driver that runs servers as local child processes
pub struct LocalProcessDriver {
    config: LocalDriverConfig,
    children: DashMap<ServerKey, Child>,
    progress: DashMap<ServerKey, mpsc::UnboundedSender<ProgressEvent>>,
}

impl LocalProcessDriver {
    /// Create a driver with the given launch settings
    pub fn new(config: LocalDriverConfig) -> Self {
        Self {
            config,
            children: DashMap::new(),
            progress: DashMap::new(),
        }
    }

    /// Number of tracked child processes
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if no child processes are tracked
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn report(&self, key: &ServerKey, progress: u8, message: String) {
        if let Some(tx) = self.progress.get(key) {
            let _ = tx.send(ProgressEvent::new(progress, message));
        }
    }

    async fn free_port(&self) -> Result<u16, DriverError> {
        let listener = TcpListener::bind((self.config.ip.as_str(), 0))
            .await
            .map_err(|e| {
                DriverError::Failed(format!("No free port on {}: {}", self.config.ip, e))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| DriverError::Failed(format!("No free port: {}", e)))?
            .port();
        Ok(port)
    }

    fn command(&self, key: &ServerKey, options: &ServerOptions, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.args_for_port(port))
            .envs(&self.config.env)
            .envs(option_env(options))
            .env(format!("{}USER", ENV_PREFIX), &key.user)
            .env(format!("{}SERVER_NAME", ENV_PREFIX), &key.name)
            .env(format!("{}PORT", ENV_PREFIX), port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Check whether the child for `key` has exited
    fn exit_status(&self, key: &ServerKey) -> Option<Option<i32>> {
        let mut child = self.children.get_mut(key)?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to poll process for {}: {}", key, e);
                None
            }
        }
    }

    async fn kill(&self, key: &ServerKey) -> Result<(), DriverError> {
        let Some((_, mut child)) = self.children.remove(key) else {
            return Ok(());
        };
        if let Err(e) = child.start_kill() {
            // InvalidInput means the child already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(DriverError::Failed(format!("Failed to kill {}: {}", key, e)));
            }
        }
        match child.wait().await {
            Ok(status) => {
                tracing::debug!("Process for {} exited with {}", key, status);
                Ok(())
            }
            Err(e) => Err(DriverError::Failed(format!("Failed to reap {}: {}", key, e))),
        }
    }

    async fn launch(
        &self,
        key: &ServerKey,
        options: &ServerOptions,
        cancel: &CancellationToken,
    ) -> Result<String, DriverError> {
        let port = self.free_port().await?;
        self.report(key, 20, format!("Launching {} on port {}", self.config.command, port));

        let child = self
            .command(key, options, port)
            .spawn()
            .map_err(|e| {
                DriverError::Failed(format!("Failed to run {}: {}", self.config.command, e))
            })?;
        tracing::info!("Started process {:?} for {} on port {}", child.id(), key, port);
        self.children.insert(key.clone(), child);

        self.report(key, 60, format!("Waiting for port {}", port));
        let addr = (self.config.ip.as_str(), port);
        loop {
            if cancel.is_cancelled() {
                self.kill(key).await?;
                return Err(DriverError::Cancelled);
            }
            if let Some(code) = self.exit_status(key) {
                self.children.remove(key);
                return Err(DriverError::Failed(match code {
                    Some(code) => {
                        format!("Process exited with code {} before becoming ready", code)
                    }
                    None => "Process was killed before becoming ready".to_string(),
                }));
            }
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(format!("http://{}:{}", self.config.ip, port));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// `SPAWNHUB_OPTION_<KEY>` variables for spawn options
fn option_env(options: &ServerOptions) -> Vec<(String, String)> {
    options
        .iter()
        .map(|(key, value)| {
            let name: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("{}OPTION_{}", ENV_PREFIX, name), value)
        })
        .collect()
}

#[async_trait]
impl ProcessDriver for LocalProcessDriver {
    async fn start(
        &self,
        key: &ServerKey,
        options: &ServerOptions,
        cancel: CancellationToken,
    ) -> Result<String, DriverError> {
        let result = self.launch(key, options, &cancel).await;
        // Dropping the sender ends the progress stream
        self.progress.remove(key);
        if let Err(e) = &result {
            if !matches!(e, DriverError::Cancelled) {
                if let Err(e) = self.kill(key).await {
                    tracing::warn!("Cleanup of {} failed: {}", key, e);
                }
            }
        }
        result
    }

    async fn stop(&self, key: &ServerKey) -> Result<(), DriverError> {
        self.kill(key).await
    }

    fn poll(&self, key: &ServerKey) -> ProcessStatus {
        if !self.children.contains_key(key) {
            return ProcessStatus::Exited(None);
        }
        match self.exit_status(key) {
            Some(code) => ProcessStatus::Exited(code),
            None => ProcessStatus::Running,
        }
    }

    fn progress(&self, key: &ServerKey) -> Option<BoxStream<'static, ProgressEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress.insert(key.clone(), tx);
        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        });
        Some(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_env_names_and_values() {
        let mut options = ServerOptions::new();
        options.insert("profile".into(), serde_json::json!("gpu"));
        options.insert("cpu-count".into(), serde_json::json!(4));

        let mut env = option_env(&options);
        env.sort();
        assert_eq!(
            env,
            vec![
                ("SPAWNHUB_OPTION_CPU_COUNT".to_string(), "4".to_string()),
                ("SPAWNHUB_OPTION_PROFILE".to_string(), "gpu".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_poll_and_stop_unknown_key() {
        let driver = LocalProcessDriver::new(LocalDriverConfig::default());
        let key = ServerKey::default_server("nobody");
        assert_eq!(driver.poll(&key), ProcessStatus::Exited(None));
        assert!(driver.stop(&key).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_early_fails_start() {
        let driver = LocalProcessDriver::new(LocalDriverConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            ..Default::default()
        });
        let key = ServerKey::default_server("alice");
        let err = driver
            .start(&key, &ServerOptions::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Failed(msg) if msg.contains("code 3")));
        assert!(driver.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_start_kills_process() {
        let driver = LocalProcessDriver::new(LocalDriverConfig {
            command: "sleep".into(),
            args: vec!["30".into()],
            ..Default::default()
        });
        let key = ServerKey::default_server("alice");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = driver
            .start(&key, &ServerOptions::new(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
        assert_eq!(driver.poll(&key), ProcessStatus::Exited(None));
    }
}
