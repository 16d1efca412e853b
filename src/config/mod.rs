//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk, applying
//! environment overrides and parsing it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path given as the first CLI argument
//! 2. Default location:
//!    - **Linux/macOS:** `~/.mcp-transport-bridge/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-transport-bridge\config.json`
//!
//! # Environment Overrides
//!
//! | Variable              | Overrides             |
//! |-----------------------|-----------------------|
//! | `MCP_WS_PORT`         | `duplex.port`         |
//! | `MCP_SSE_PORT`        | `streaming.port`      |
//! | `MCP_BACKEND_COMMAND` | `backend.command`     |
//! | `MCP_BACKEND_CWD`     | `backend.working_dir` |

mod settings;

pub use settings::{
    BackendConfig, Config, DuplexConfig, HealthConfig, LoggingConfig, RelayConfig,
    StreamingConfig,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable overriding the WebSocket port.
pub const ENV_WS_PORT: &str = "MCP_WS_PORT";
/// Environment variable overriding the SSE port.
pub const ENV_SSE_PORT: &str = "MCP_SSE_PORT";
/// Environment variable overriding the backend executable.
pub const ENV_BACKEND_COMMAND: &str = "MCP_BACKEND_COMMAND";
/// Environment variable overriding the backend working directory.
pub const ENV_BACKEND_CWD: &str = "MCP_BACKEND_CWD";

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-transport-bridge/`
/// - **Windows:** `%USERPROFILE%\.mcp-transport-bridge\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-transport-bridge"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads, overrides and validates the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location.
/// Environment overrides are read from the process environment.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - An environment override is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_config`], with environment lookups supplied by `env`.
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_with_env<F>(path: Option<&Path>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from("<default config path>"),
        })?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let mut config: Config =
        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: config_path.clone(),
            source: e,
        })?;

    apply_env_overrides(&mut config, env)?;

    config.validate()?;

    Ok(config)
}

/// Applies the environment overrides listed in the module docs.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnv`] if a port override is not a valid port.
pub fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<(), ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    if let Some(port) = env(ENV_WS_PORT) {
        config.duplex.port = parse_port(ENV_WS_PORT, port)?;
    }
    if let Some(port) = env(ENV_SSE_PORT) {
        config.streaming.port = parse_port(ENV_SSE_PORT, port)?;
    }
    if let Some(command) = env(ENV_BACKEND_COMMAND) {
        config.backend.command = command;
    }
    if let Some(dir) = env(ENV_BACKEND_CWD) {
        config.backend.working_dir = Some(PathBuf::from(dir));
    }
    Ok(())
}

fn parse_port(name: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}
