//! Sessions and the session registry.
//!
//! A [`Session`] is the bridge's bookkeeping for one client conversation. Its
//! state only moves forward:
//!
//! ```text
//! CONNECTING ──▶ ACTIVE ──▶ CLOSING ──▶ CLOSED
//!      │                                  ▲
//!      └──────────── setup failure ───────┘
//! ```
//!
//! The [`SessionRegistry`] is the only state shared between connection tasks.
//! For streaming sessions it holds the sender that routes posted messages to
//! the session's relay; duplex sessions are registered for bookkeeping only.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::mcp::framing::Frame;

/// Opaque session identifier, unique for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Which transport carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent WebSocket connection.
    DuplexSocket,
    /// SSE stream plus a companion POST endpoint.
    StreamingHttp,
}

impl TransportKind {
    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DuplexSocket => "duplex-socket",
            Self::StreamingHttp => "streaming-http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, backend not yet acquired.
    Connecting,
    /// Backend bound, messages flowing.
    Active,
    /// Teardown in progress.
    Closing,
    /// Finished. Terminal.
    Closed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Active | Self::Closed)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Active => "ACTIVE",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        })
    }
}

/// One logical client conversation.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    transport: TransportKind,
    created_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    /// Creates a session in `Connecting`.
    #[must_use]
    pub fn new(transport: TransportKind) -> Self {
        Self {
            id: SessionId::new(),
            transport,
            created_at: Utc::now(),
            state: SessionState::Connecting,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Transport carrying this session.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }

    /// When the session was accepted.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] if the state machine forbids it.
    pub fn transition(&mut self, next: SessionState) -> Result<(), BridgeError> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            session = %self.id,
            transport = %self.transport,
            from = %self.state,
            to = %next,
            "session transition"
        );
        self.state = next;
        Ok(())
    }

    /// `Connecting -> Active`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] unless connecting.
    pub fn activate(&mut self) -> Result<(), BridgeError> {
        self.transition(SessionState::Active)
    }

    /// `Active -> Closing`. A session that is already closing stays put.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] from `Connecting` or `Closed`.
    pub fn begin_closing(&mut self) -> Result<(), BridgeError> {
        if self.state == SessionState::Closing {
            return Ok(());
        }
        self.transition(SessionState::Closing)
    }

    /// Moves to `Closed` from `Connecting` or `Closing`.
    ///
    /// Returns `true` if this call closed the session and `false` if it was
    /// already closed, so teardown side effects run exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] from `Active`.
    pub fn close(&mut self) -> Result<bool, BridgeError> {
        if self.state == SessionState::Closed {
            return Ok(false);
        }
        self.transition(SessionState::Closed)?;
        Ok(true)
    }
}

/// What the registry knows about one open session.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Transport carrying the session.
    pub transport: TransportKind,
    /// When the session was accepted.
    pub created_at: DateTime<Utc>,
    inbound: Option<mpsc::Sender<Frame>>,
}

/// Maps session ids to their routing entries.
///
/// Cloning yields another handle to the same registry. The lock is never
/// held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<SessionId, RegistryEntry>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, RegistryEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `session`, optionally with the sender that feeds its relay.
    pub fn register(&self, session: &Session, inbound: Option<mpsc::Sender<Frame>>) {
        let entry = RegistryEntry {
            transport: session.transport(),
            created_at: session.created_at(),
            inbound,
        };
        self.lock().insert(session.id(), entry);
    }

    /// Returns the inbound sender registered for `id`.
    ///
    /// `None` if the session is unknown or takes no posted messages.
    #[must_use]
    pub fn sender(&self, id: &SessionId) -> Option<mpsc::Sender<Frame>> {
        self.lock().get(id).and_then(|entry| entry.inbound.clone())
    }

    /// Removes `id`, dropping its inbound sender. Returns whether it existed.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Whether `id` is registered.
    #[cfg(test)]
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Entry for `id`, if registered.
    #[cfg(test)]
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<RegistryEntry> {
        self.lock().get(id).cloned()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of registered sessions carried by `transport`.
    #[must_use]
    pub fn count(&self, transport: TransportKind) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.transport == transport)
            .count()
    }
}
