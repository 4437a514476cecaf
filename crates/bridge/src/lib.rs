//! Capability queries against running local plugins and remote MCP endpoints.
//!
//! Speaks MCP JSON-RPC 2.0 over three transports: stdio for local processes,
//! streamable HTTP and legacy SSE for remote endpoints.

pub mod bridge;
pub mod client;
pub mod error;
pub mod http;
pub mod local;
pub mod sse;
pub mod traits;
pub mod transport;
pub mod types;

pub use {
    bridge::BridgeClient,
    client::McpClient,
    error::{BridgeError, Result},
    http::StreamableHttpTransport,
    local::LocalServices,
    sse::SseTransport,
    traits::McpTransport,
    transport::StdioTransport,
    types::McpToolDef,
};
