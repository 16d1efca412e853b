//! Health/status endpoint.
//!
//! Reports a fixed descriptor built from configuration at startup. It never
//! consults the session registry, so it answers the same way no matter how
//! many sessions are open.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::bridge::server::BridgeState;
use crate::config::HealthConfig;
use crate::mcp::protocol::MCP_PROTOCOL_VERSION;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDescriptor {
    /// Always `healthy` while the listener answers.
    pub status: &'static str,
    /// Service name.
    pub server: String,
    /// MCP protocol version spoken through the bridge.
    pub protocol_version: &'static str,
    /// Number of tool categories the backend exposes.
    pub tools: u32,
    /// Transport served by this listener.
    pub transport: &'static str,
}

impl HealthDescriptor {
    /// Builds the descriptor from configuration.
    #[must_use]
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            status: "healthy",
            server: config.server_name.clone(),
            protocol_version: MCP_PROTOCOL_VERSION,
            tools: config.tool_count,
            transport: "SSE",
        }
    }
}

/// `GET /health`
pub async fn health(State(state): State<Arc<BridgeState>>) -> Json<HealthDescriptor> {
    Json(state.health().clone())
}
