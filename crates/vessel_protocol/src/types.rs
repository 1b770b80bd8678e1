//! Canonical process and server types shared by both domains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Process Identity
// ============================================================================

/// Canonical process identifier within one container lifetime.
///
/// Allocated monotonically from 1 by the worker; never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Pid> for u32 {
    fn from(value: Pid) -> Self {
        value.0
    }
}

impl FromStr for Pid {
    type Err = PidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u32>()
            .map_err(|_| PidError::Parse(s.to_string()))?;
        Ok(Pid::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PidError {
    #[error("invalid pid: {0}")]
    Parse(String),
}

// ============================================================================
// Process Kind & State
// ============================================================================

/// What kind of executor backs a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Runs inside the embedded scripting runtime.
    Script,
    /// Runs the builtin shell interpreter.
    Shell,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Script => "script",
            ProcessKind::Shell => "shell",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "script" => Ok(ProcessKind::Script),
            "shell" => Ok(ProcessKind::Shell),
            _ => Err(format!("Invalid process kind: '{}'", s)),
        }
    }
}

/// Lifecycle of a process inside the worker.
///
/// Transitions are monotonic: Created -> Running -> one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Allocated but the executor has not started yet
    #[default]
    Created,
    /// Executor is running
    Running,
    /// Exited with code 0
    Completed,
    /// Exited with a non-zero code or an execution error
    Failed,
    /// Stopped by a terminate request
    Terminated,
}

impl ProcessState {
    pub const ALL: &'static [ProcessState] = &[
        ProcessState::Created,
        ProcessState::Running,
        ProcessState::Completed,
        ProcessState::Failed,
        ProcessState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Terminated
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(ProcessState::Created),
            "running" => Ok(ProcessState::Running),
            "completed" => Ok(ProcessState::Completed),
            "failed" => Ok(ProcessState::Failed),
            "terminated" => Ok(ProcessState::Terminated),
            _ => Err(format!("Invalid process state: '{}'", s)),
        }
    }
}

/// Options accepted by `spawn`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Working directory inside the virtual filesystem.
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// Environment visible to the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: default_cwd(),
            env: HashMap::new(),
        }
    }
}

/// Point-in-time view of a live process, reported by `getStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: Pid,
    pub kind: ProcessKind,
    pub state: ProcessState,
    pub command: String,
    pub uptime_ms: u64,
}

// ============================================================================
// Virtual Servers
// ============================================================================

/// Protocol family a virtual server is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Http,
    Https,
    Tcp,
    Udp,
    Ws,
    Wss,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Http => "http",
            ServerKind::Https => "https",
            ServerKind::Tcp => "tcp",
            ServerKind::Udp => "udp",
            ServerKind::Ws => "ws",
            ServerKind::Wss => "wss",
        }
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ServerKind::Http),
            "https" => Ok(ServerKind::Https),
            "tcp" => Ok(ServerKind::Tcp),
            "udp" => Ok(ServerKind::Udp),
            "ws" => Ok(ServerKind::Ws),
            "wss" => Ok(ServerKind::Wss),
            _ => Err(format!("Invalid server kind: '{}'", s)),
        }
    }
}

/// Key into the server table. Renders as `"{type}:{port}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    pub kind: ServerKind,
    pub port: u16,
}

impl ServerId {
    pub const fn new(kind: ServerKind, port: u16) -> Self {
        Self { kind, port }
    }

    pub fn http(port: u16) -> Self {
        Self::new(ServerKind::Http, port)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.port)
    }
}

impl FromStr for ServerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, port) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid server id: '{}'", s))?;
        let kind = ServerKind::from_str(kind)?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("Invalid server port in '{}'", s))?;
        Ok(ServerId::new(kind, port))
    }
}

/// Whether a server is accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Running,
    Stopped,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Listen options supplied by in-sandbox code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlog: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Registry view of one virtual server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub pid: Pid,
    pub status: ServerStatus,
    #[serde(default)]
    pub options: ServerOptions,
    pub started_at: DateTime<Utc>,
}

/// Monotonic per-server counters. Shares the server's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub active_connections: u64,
    pub started_at: DateTime<Utc>,
}

impl ServerStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            requests_total: 0,
            requests_success: 0,
            requests_failed: 0,
            bytes_received: 0,
            bytes_sent: 0,
            active_connections: 0,
            started_at,
        }
    }
}

// ============================================================================
// Aggregated Stats
// ============================================================================

/// Aggregates derived from the rolling request log.
///
/// Traffic counters cover the 5-minute retention window; `requests_per_minute`
/// covers the trailing minute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrafficStats {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub avg_response_time_ms: f64,
    pub requests_per_minute: u64,
    pub active_connections: u64,
}

/// Network-wide view reported by `getStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkStats {
    pub servers: Vec<ServerInfo>,
    pub traffic: TrafficStats,
}

/// Worker-reported container stats (`getStats` reply payload).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerStats {
    pub processes: Vec<ProcessSnapshot>,
    pub network: NetworkStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrips_through_strings() {
        let pid = Pid::new(42);
        assert_eq!(pid.to_string(), "42");
        assert_eq!("42".parse::<Pid>().unwrap(), pid);
        assert!(" 7 ".parse::<Pid>().is_ok());
        assert!("minus".parse::<Pid>().is_err());
    }

    #[test]
    fn process_state_terminality() {
        assert!(!ProcessState::Created.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Completed.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(ProcessState::Terminated.is_terminal());
    }

    #[test]
    fn server_id_renders_as_type_colon_port() {
        let id = ServerId::http(8080);
        assert_eq!(id.to_string(), "http:8080");
        assert_eq!("http:8080".parse::<ServerId>().unwrap(), id);
        assert!("http".parse::<ServerId>().is_err());
        assert!("smtp:25".parse::<ServerId>().is_err());
        assert!("tcp:notaport".parse::<ServerId>().is_err());
    }

    #[test]
    fn spawn_options_default_to_root_cwd() {
        let opts: SpawnOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.cwd, "/");
        assert!(opts.env.is_empty());
    }
}
