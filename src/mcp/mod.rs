//! Model Context Protocol wire handling.
//!
//! The bridge does not interpret MCP traffic. It only needs to split and
//! join JSON-RPC 2.0 messages on the stdio transport's newline framing, and
//! to produce the few JSON-RPC errors it answers on its own.
//!
//! # Protocol Version
//!
//! The bridge reports MCP protocol version 2024-11-05.

pub mod framing;
pub mod protocol;

pub use framing::{Frame, FrameReader, FrameWriter};
pub use protocol::{JsonRpcError, MCP_PROTOCOL_VERSION};
