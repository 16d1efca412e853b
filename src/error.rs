//! Error types for mcp-transport-bridge.
//!
//! The bridge distinguishes configuration problems (fatal at startup) from
//! per-session failures. A [`BridgeError`] always ends the session it occurred
//! in and never the listener that accepted it.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bridge::session::SessionState;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// An environment override held a value that could not be used.
    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised while splitting or normalising protocol frames.
#[derive(Error, Debug)]
pub enum FramingError {
    /// A frame grew past the configured limit before its delimiter arrived.
    #[error("frame exceeds {limit} bytes")]
    TooLarge {
        /// The configured maximum frame size.
        limit: usize,
    },

    /// A frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// A client payload contained nothing but whitespace.
    #[error("empty payload")]
    Empty,

    /// A payload could not be reduced to a single-line JSON message.
    #[error("payload is not a single JSON message")]
    Malformed {
        /// The JSON error encountered while compacting the payload.
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the underlying stream failed.
    #[error("stream I/O failed")]
    Io(#[from] io::Error),
}

/// Errors that end a bridge session.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The backend process could not be started.
    #[error("failed to spawn backend `{command}`")]
    Spawn {
        /// The configured backend command.
        command: String,
        /// The underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// A short-message call referenced no open session.
    #[error("session not established")]
    SessionNotEstablished,

    /// A frame could not be read, written or normalised.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The client connection or a backend pipe failed.
    #[error("transport failure")]
    Transport(#[source] io::Error),

    /// The backend exited while the session was still active.
    #[error("backend exited (code {code:?})")]
    BackendExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// A session state transition that the state machine forbids.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err)
    }
}
