//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one named server belonging to one user.
///
/// An empty `name` addresses the user's default server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    /// Owning user
    pub user: String,
    /// Server name (empty for the default server)
    pub name: String,
}

impl ServerKey {
    /// Create a new server key
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }

    /// Key of a user's default (unnamed) server
    pub fn default_server(user: impl Into<String>) -> Self {
        Self::new(user, "")
    }

    /// Whether this addresses the default server
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Parse `user` or `user/name`
    pub fn parse(spec: &str) -> Option<Self> {
        let (user, name) = match spec.split_once('/') {
            Some((user, name)) => (user, name),
            None => (spec, ""),
        };
        if user.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(user, name))
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{}/{}", self.user, self.name)
        }
    }
}

/// Opaque options supplied at spawn time.
///
/// Persisted on the record and reused for the next spawn when none are given.
pub type ServerOptions = BTreeMap<String, serde_json::Value>;

/// Lifecycle state of a server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// No process, nothing pending
    #[default]
    Stopped,
    /// A spawn is in flight
    PendingSpawn,
    /// The process is up and routed
    Running,
    /// A stop is in flight
    PendingStop,
    /// The last spawn attempt failed
    Failed,
}

impl ServerState {
    /// Whether an operation is in flight
    pub fn is_pending(self) -> bool {
        matches!(self, ServerState::PendingSpawn | ServerState::PendingStop)
    }

    /// The pending operation implied by this state
    pub fn pending_operation(self) -> Option<OperationKind> {
        match self {
            ServerState::PendingSpawn => Some(OperationKind::Spawn),
            ServerState::PendingStop => Some(OperationKind::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::PendingSpawn => write!(f, "pending_spawn"),
            ServerState::Running => write!(f, "running"),
            ServerState::PendingStop => write!(f, "pending_stop"),
            ServerState::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Start a server process
    Spawn,
    /// Stop a server process
    Stop,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Spawn => write!(f, "spawn"),
            OperationKind::Stop => write!(f, "stop"),
        }
    }
}

/// Point-in-time view of one server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Record identity
    pub key: ServerKey,
    /// Current lifecycle state
    pub state: ServerState,
    /// Address of the running process (set only while running)
    pub url: Option<String>,
    /// When the current process became ready (unix millis)
    pub started_at: Option<u64>,
    /// Most recent activity report (unix millis)
    pub last_activity: Option<u64>,
    /// Options used for the last (or next) spawn
    pub options: ServerOptions,
    /// Reason the last spawn failed, kept while `state == Failed`
    pub failure: Option<String>,
}

impl ServerSnapshot {
    /// Snapshot of a never-started record
    pub fn stopped(key: ServerKey) -> Self {
        Self {
            key,
            state: ServerState::Stopped,
            url: None,
            started_at: None,
            last_activity: None,
            options: ServerOptions::new(),
            failure: None,
        }
    }

    /// The pending operation, if any
    pub fn pending_operation(&self) -> Option<OperationKind> {
        self.state.pending_operation()
    }

    /// Whether the server is running
    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }
}

/// Durable subset of a server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record identity
    pub key: ServerKey,
    /// Options to reuse on the next spawn
    #[serde(default)]
    pub options: ServerOptions,
    /// URL of the process if it was running when saved
    #[serde(default)]
    pub url: Option<String>,
    /// When the process became ready
    #[serde(default)]
    pub started_at: Option<u64>,
    /// Most recent activity
    #[serde(default)]
    pub last_activity: Option<u64>,
}

impl From<&ServerSnapshot> for StoredRecord {
    fn from(snapshot: &ServerSnapshot) -> Self {
        Self {
            key: snapshot.key.clone(),
            options: snapshot.options.clone(),
            url: snapshot.url.clone(),
            started_at: snapshot.started_at,
            last_activity: snapshot.last_activity,
        }
    }
}

/// One unit of a live spawn-status stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Percent complete, 0..=100
    pub progress: u8,
    /// Plain-text status line
    pub message: String,
    /// Optional HTML rendition of `message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_message: Option<String>,
    /// Server URL, present on the ready event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Set on the terminal event of a successful spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    /// Set on the terminal event of a failed spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
}

impl ProgressEvent {
    /// Terminal progress value
    pub const COMPLETE: u8 = 100;

    /// Intermediate event
    pub fn new(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: progress.min(Self::COMPLETE),
            message: message.into(),
            ..Default::default()
        }
    }

    /// First event of every live subscription
    pub fn requested() -> Self {
        Self::new(0, "Server requested")
    }

    /// Terminal event for a server that came up at `url`
    pub fn ready(url: &str) -> Self {
        Self {
            progress: Self::COMPLETE,
            message: format!("Server ready at {}", url),
            html_message: Some(format!("Server ready at <a href=\"{0}\">{0}</a>", url)),
            url: Some(url.to_string()),
            ready: Some(true),
            failed: None,
        }
    }

    /// Terminal event for a spawn that failed
    pub fn failed(reason: &str) -> Self {
        Self {
            progress: Self::COMPLETE,
            message: format!("Spawn failed: {}", reason),
            failed: Some(true),
            ..Default::default()
        }
    }

    /// Whether this event ends a sequence
    pub fn is_terminal(&self) -> bool {
        self.progress >= Self::COMPLETE
    }
}

/// Entry in the external proxy's routing table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteEntry {
    /// URL prefix routed to the target
    pub path_prefix: String,
    /// Address of the backing process
    pub target_url: String,
}

impl RouteEntry {
    /// Create a new route entry
    pub fn new(path_prefix: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            target_url: target_url.into(),
        }
    }
}

/// Liveness of a driver-managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// The process is alive
    Running,
    /// The process is gone, with its exit code if known
    Exited(Option<i32>),
}

impl ProcessStatus {
    /// Whether the process is alive
    pub fn is_running(self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}
