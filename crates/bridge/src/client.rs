//! MCP client: the protocol handshake and tool listing over any transport.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    traits::McpTransport,
    types::{InitializeParams, InitializeResult, McpToolDef, ToolsListResult},
};

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 16;

/// An initialized MCP session with one server.
pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    server_info: InitializeResult,
}

impl McpClient {
    /// Perform the `initialize` + `notifications/initialized` handshake.
    pub async fn initialize(name: &str, transport: Arc<dyn McpTransport>) -> Result<Self> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let resp = match transport.request("initialize", Some(params)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(server = %name, error = %e, "MCP initialize handshake failed");
                return Err(e);
            },
        };

        let result = resp
            .result
            .ok_or_else(|| BridgeError::protocol("initialize returned no result"))?;
        let server_info: InitializeResult = serde_json::from_value(result)
            .map_err(|e| BridgeError::protocol(format!("invalid initialize result: {e}")))?;

        info!(
            server = %name,
            protocol = %server_info.protocol_version,
            server_name = %server_info.server_info.name,
            "MCP server initialized"
        );

        transport.notify("notifications/initialized", None).await?;

        Ok(Self {
            name: name.to_string(),
            transport,
            server_info,
        })
    }

    pub fn server_info(&self) -> &InitializeResult {
        &self.server_info
    }

    /// Fetch every tool the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let resp = self.transport.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(
                resp.result
                    .ok_or_else(|| BridgeError::protocol("tools/list returned no result"))?,
            )
            .map_err(|e| BridgeError::protocol(format!("invalid tools/list result: {e}")))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(server = %self.name, count = tools.len(), "listed MCP tools");
        Ok(tools)
    }

    /// Tool names only, in server order.
    pub async fn tool_names(&self) -> Result<Vec<String>> {
        Ok(self
            .list_tools()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    pub async fn shutdown(&self) {
        self.transport.kill().await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::JsonRpcResponse,
        async_trait::async_trait,
        serde_json::{Value, json},
        std::sync::Mutex,
    };

    /// Answers from a queue of canned results and records every call.
    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<Vec<Value>>,
        calls: Mutex<Vec<(String, Option<Value>)>>,
    }

    impl ScriptedTransport {
        fn new(mut results: Vec<Value>) -> Arc<Self> {
            results.reverse();
            Arc::new(Self {
                results: Mutex::new(results),
                calls: Mutex::default(),
            })
        }

        fn methods(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(m, _)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
            self.calls.lock().unwrap().push((method.into(), params));
            let result = self.results.lock().unwrap().pop().unwrap();
            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: json!(1),
                result: Some(result),
                error: None,
            })
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
            self.calls.lock().unwrap().push((method.into(), params));
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn kill(&self) {}
    }

    fn init_result() -> Value {
        json!({"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"weather"}})
    }

    #[tokio::test]
    async fn test_handshake_then_tools() {
        let transport = ScriptedTransport::new(vec![
            init_result(),
            json!({"tools":[{"name":"forecast","inputSchema":{}}]}),
        ]);
        let client = McpClient::initialize("weather", transport.clone()).await.unwrap();
        assert_eq!(client.server_info().server_info.name, "weather");
        assert_eq!(client.tool_names().await.unwrap(), vec!["forecast"]);
        assert_eq!(transport.methods(), [
            "initialize",
            "notifications/initialized",
            "tools/list"
        ]);
    }

    #[tokio::test]
    async fn test_tools_follow_cursor() {
        let transport = ScriptedTransport::new(vec![
            init_result(),
            json!({"tools":[{"name":"a"}],"nextCursor":"p2"}),
            json!({"tools":[{"name":"b"}]}),
        ]);
        let client = McpClient::initialize("paged", transport.clone()).await.unwrap();
        assert_eq!(client.tool_names().await.unwrap(), vec!["a", "b"]);
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[3].1, Some(json!({"cursor":"p2"})));
    }

    #[tokio::test]
    async fn test_bad_initialize_result_is_protocol_error() {
        let transport = ScriptedTransport::new(vec![json!({"unexpected": true})]);
        let err = McpClient::initialize("x", transport).await.err().unwrap();
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }
}
