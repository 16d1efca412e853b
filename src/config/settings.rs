//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Backend worker process settings.
    pub backend: BackendConfig,

    /// WebSocket listener settings.
    #[serde(default)]
    pub duplex: DuplexConfig,

    /// SSE listener settings.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Relay buffering and framing limits.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Static descriptor returned by the health endpoint.
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Builds a configuration around a backend with every other section at
    /// its defaults.
    #[must_use]
    pub fn with_backend(backend: BackendConfig) -> Self {
        Self {
            _schema: None,
            _comment: None,
            backend,
            duplex: DuplexConfig::default(),
            streaming: StreamingConfig::default(),
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.command.trim().is_empty() {
            return Err(invalid("backend.command must not be empty"));
        }

        if !self.duplex.enabled && !self.streaming.enabled {
            return Err(invalid(
                "at least one of duplex or streaming must be enabled",
            ));
        }

        if self.duplex.enabled
            && self.streaming.enabled
            && self.duplex.port != 0
            && self.duplex.port == self.streaming.port
            && self.duplex.bind == self.streaming.bind
        {
            return Err(invalid(format!(
                "duplex and streaming listeners both use {}:{}",
                self.duplex.bind, self.duplex.port
            )));
        }

        if !self.streaming.messages_path.starts_with('/') {
            return Err(invalid(format!(
                "streaming.messages_path '{}' must start with '/'",
                self.streaming.messages_path
            )));
        }

        if matches!(self.streaming.messages_path.as_str(), "/sse" | "/health") {
            return Err(invalid(format!(
                "streaming.messages_path '{}' collides with a built-in route",
                self.streaming.messages_path
            )));
        }

        if self.streaming.keep_alive_secs == 0 {
            return Err(invalid("streaming.keep_alive_secs must be greater than 0"));
        }

        if self.relay.channel_capacity == 0 {
            return Err(invalid("relay.channel_capacity must be greater than 0"));
        }

        if self.relay.max_message_bytes == 0 {
            return Err(invalid("relay.max_message_bytes must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Backend worker process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Executable to spawn for each session.
    pub command: String,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory of the spawned process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the backend (credentials live here).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long to wait after SIGTERM before killing the process, in ms.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long to wait for a killed process to be reaped, in ms.
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl BackendConfig {
    /// Creates a backend configuration for `command` with default timeouts.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }

    /// Adds arguments to the backend command line.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Grace period between SIGTERM and a forced kill.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Upper bound on reaping a killed process.
    #[must_use]
    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

const fn default_shutdown_grace_ms() -> u64 {
    2_000
}

const fn default_kill_timeout_ms() -> u64 {
    2_000
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplexConfig {
    /// Whether the WebSocket listener is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to bind.
    #[serde(default = "default_duplex_port")]
    pub port: u16,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_bind(),
            port: default_duplex_port(),
        }
    }
}

const fn default_duplex_port() -> u16 {
    8001
}

/// SSE listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingConfig {
    /// Whether the HTTP listener is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to bind.
    #[serde(default = "default_streaming_port")]
    pub port: u16,

    /// Path of the client-to-server message endpoint.
    #[serde(default = "default_messages_path")]
    pub messages_path: String,

    /// Interval between SSE keep-alive comments, in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl StreamingConfig {
    /// Keep-alive interval for open streams.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_bind(),
            port: default_streaming_port(),
            messages_path: default_messages_path(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

const fn default_streaming_port() -> u16 {
    3001
}

fn default_messages_path() -> String {
    "/messages".to_string()
}

const fn default_keep_alive_secs() -> u64 {
    15
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Frames buffered per direction before the sender waits.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Largest single frame accepted in either direction.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

const fn default_channel_capacity() -> usize {
    64
}

const fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

/// Health endpoint descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Service name reported as `server`.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Number of tool categories the backend exposes.
    #[serde(default)]
    pub tool_count: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            tool_count: 0,
        }
    }
}

fn default_server_name() -> String {
    "mcp-transport-bridge".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

const fn default_true() -> bool {
    true
}
