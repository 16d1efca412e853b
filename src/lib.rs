//! mcp-transport-bridge: network transports for stdio MCP servers
//!
//! Many MCP servers only speak JSON-RPC over stdin/stdout. This library puts
//! them on the network: every WebSocket connection or SSE session gets its
//! own backend process, and messages are relayed between the two unchanged.
//!
//! # Transports
//!
//! - **WebSocket**: one connection, messages in both directions
//! - **SSE**: a `GET /sse` event stream for backend output plus
//!   `POST /messages` for client input
//!
//! # Modules
//!
//! - [`bridge`] - Sessions, backend supervision, relay and listeners
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types
//! - [`mcp`] - JSON-RPC framing and protocol helpers

pub mod bridge;
pub mod config;
pub mod error;
pub mod mcp;
