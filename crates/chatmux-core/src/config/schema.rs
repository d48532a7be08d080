//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main ChatMux configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Session management.
    #[serde(default)]
    pub session: SessionConfig,

    /// Gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker process and pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program to spawn for each worker.
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments passed to the worker program.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Working directory for worker processes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for worker processes.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Minimum pool size (pre-warmed at startup).
    #[serde(default = "default_min")]
    pub min: usize,

    /// Maximum pool size (elastic ceiling).
    #[serde(default = "default_max")]
    pub max: usize,

    /// Base backoff between spawn retries, in milliseconds.
    #[serde(default = "default_spawn_backoff_ms")]
    pub spawn_backoff_ms: u64,

    /// Spawn attempts before the pool reports degraded capacity.
    #[serde(default = "default_max_spawn_attempts")]
    pub max_spawn_attempts: u32,

    /// Timeout for control commands (ping, abort), in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle timeout for a streaming turn (no events received), in seconds.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,

    /// Health check interval, in seconds.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    /// Consecutive health check failures before a worker is replaced.
    #[serde(default = "default_health_check_failures")]
    pub health_check_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            cwd: None,
            env: HashMap::new(),
            min: default_min(),
            max: default_max(),
            spawn_backoff_ms: default_spawn_backoff_ms(),
            max_spawn_attempts: default_max_spawn_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            health_check_secs: default_health_check_secs(),
            health_check_failures: default_health_check_failures(),
        }
    }
}

impl WorkerConfig {
    /// Control command timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Turn idle timeout as a Duration.
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    /// Health check interval as a Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }
}

fn default_program() -> String {
    "pi".to_string()
}

fn default_args() -> Vec<String> {
    vec!["--mode".to_string(), "rpc".to_string()]
}

fn default_min() -> usize {
    1
}

fn default_max() -> usize {
    4
}

fn default_spawn_backoff_ms() -> u64 {
    500
}

fn default_max_spawn_attempts() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_turn_timeout_secs() -> u64 {
    300
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_health_check_failures() -> u32 {
    3
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding persisted session records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Inactivity window before an active session becomes idle, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Inactivity window before an idle session is closed, in seconds.
    #[serde(default = "default_evict_after_secs")]
    pub evict_after_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
            evict_after_secs: default_evict_after_secs(),
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Eviction window as a Duration.
    pub fn evict_after(&self) -> Duration {
        Duration::from_secs(self.evict_after_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatmux")
}

fn default_idle_timeout_secs() -> u64 {
    900
}

fn default_evict_after_secs() -> u64 {
    86400
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind mode.
    #[serde(default)]
    pub bind: BindMode,

    /// Port number.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Authentication token required by the connect handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Maximum concurrent WebSocket connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Enable CORS.
    #[serde(default)]
    pub cors: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::default(),
            port: default_port(),
            auth_token: None,
            max_connections: default_max_connections(),
            cors: false,
        }
    }
}

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 18790;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    64
}

/// Network bind mode for the gateway server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to 127.0.0.1 only.
    #[default]
    Loopback,

    /// Bind to all interfaces.
    Lan,
}

impl BindMode {
    /// The IP octets to bind.
    pub fn ip(&self) -> [u8; 4] {
        match self {
            BindMode::Loopback => [127, 0, 0, 1],
            BindMode::Lan => [0, 0, 0, 0],
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by tracing's EnvFilter.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
