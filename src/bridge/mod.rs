//! Transport bridge between network clients and stdio MCP backends.
//!
//! # Architecture
//!
//! ```text
//!  WebSocket client ──▶ duplex ───┐                       ┌──▶ backend (stdio)
//!                                 ├──▶ session ─▶ relay ──┤
//!  SSE client ───────▶ streaming ─┘       │               └──▶ backend (stdio)
//!                                         ▼
//!                                     registry
//! ```
//!
//! Each client session owns exactly one backend process, spawned by the
//! [`supervisor`] when the session opens and torn down when it closes. The
//! [`relay`] moves newline-delimited frames between the two in order.

pub mod duplex;
pub mod health;
pub mod relay;
pub mod server;
pub mod session;
pub mod streaming;
pub mod supervisor;

pub use relay::{Relay, RelayEnd};
pub use server::{Bridge, BridgeState};
pub use session::{Session, SessionId, SessionRegistry, SessionState, TransportKind};
pub use supervisor::{ProcessHandle, ProcessState, Supervisor, SupervisorStats};
