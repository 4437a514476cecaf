//! Transport abstraction for MCP communication.

use {async_trait::async_trait, serde_json::Value};

use crate::{error::Result, types::JsonRpcResponse};

/// One JSON-RPC channel to an MCP server.
///
/// Implemented over a child's stdio ([`crate::StdioTransport`]), streamable
/// HTTP ([`crate::StreamableHttpTransport`]) and legacy SSE
/// ([`crate::SseTransport`]).
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the response.
    ///
    /// A JSON-RPC error object in the response is returned as
    /// [`crate::BridgeError::Protocol`].
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the underlying connection or process is still alive.
    async fn is_alive(&self) -> bool;

    /// Close the underlying connection or kill the process.
    async fn kill(&self);
}
