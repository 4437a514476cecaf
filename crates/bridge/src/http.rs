//! Streamable HTTP transport for remote MCP endpoints (`connectionType=httpStream`).
//!
//! Every JSON-RPC message is a POST to the endpoint. The server answers with
//! either a JSON body or a short event stream carrying the response.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    reqwest::{Client, StatusCode},
    secrecy::{ExposeSecret, Secret},
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{
    error::{BridgeError, Result},
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION},
};

pub(crate) const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";

pub struct StreamableHttpTransport {
    client: Client,
    url: String,
    token: Option<Secret<String>>,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, token: Option<Secret<String>>, timeout: Duration) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::external("failed to build HTTP client", e))?;

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            token,
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(None),
        }))
    }

    async fn build_post(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", STREAMABLE_ACCEPT_HEADER)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        req
    }

    async fn post(&self, method: &str, body: &impl serde::Serialize) -> Result<reqwest::Response> {
        let resp = self
            .build_post()
            .await
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::from_http(&self.url, method, e))?;

        reject_auth(&self.url, resp.status())?;
        self.store_session_id(&resp).await;
        Ok(resp)
    }

    async fn store_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return;
        };

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(url = %self.url, %session_id, "updated MCP session id");
            *slot = Some(session_id.to_string());
        }
    }
}

pub(crate) fn reject_auth(endpoint: &str, status: StatusCode) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BridgeError::AuthRejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

fn response_is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|base| base.trim() == "text/event-stream")
}

/// Pull the first JSON-RPC response out of an event-stream body.
fn parse_event_stream_response(body: &str, method: &str) -> Result<JsonRpcResponse> {
    let mut data = String::new();
    for line in body.lines().chain(std::iter::once("")) {
        let trimmed = line.trim_end();
        if let Some(rest) = trimmed.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
            continue;
        }
        if trimmed.is_empty() && !data.is_empty() {
            if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&data) {
                return Ok(resp);
            }
            data.clear();
        }
    }
    Err(BridgeError::protocol(format!(
        "no JSON-RPC response in event stream for '{method}'"
    )))
}

#[async_trait::async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        debug!(%method, %id, url = %self.url, "HTTP client -> server");

        let http_resp = self.post(method, &req).await?;
        let status = http_resp.status();
        if !status.is_success() {
            let body = http_resp.text().await.unwrap_or_default();
            return Err(BridgeError::protocol(format!(
                "HTTP {status} for '{method}': {body}"
            )));
        }

        let resp: JsonRpcResponse = if response_is_event_stream(&http_resp) {
            let body = http_resp
                .text()
                .await
                .map_err(|e| BridgeError::from_http(&self.url, method, e))?;
            parse_event_stream_response(&body, method)?
        } else {
            http_resp.json().await.map_err(|e| {
                BridgeError::protocol(format!("invalid JSON-RPC response for '{method}': {e}"))
            })?
        };

        if let Some(err) = &resp.error {
            return Err(BridgeError::protocol(format!(
                "'{method}' failed: code={} message={}",
                err.code, err.message
            )));
        }
        Ok(resp)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        debug!(%method, url = %self.url, "HTTP client -> server (notification)");
        let http_resp = self
            .post(method, &JsonRpcNotification::new(method, params))
            .await?;
        if !http_resp.status().is_success() {
            warn!(%method, status = %http_resp.status(), "notification returned non-success");
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.session_id.read().await.is_some()
    }

    async fn kill(&self) {
        let Some(session_id) = self.session_id.write().await.take() else {
            return;
        };

        let mut req = self
            .client
            .delete(&self.url)
            .timeout(Duration::from_secs(5))
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .header(MCP_SESSION_ID_HEADER, session_id);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        if let Err(e) = req.send().await {
            warn!(url = %self.url, error = %e, "failed to close MCP session");
        }
    }
}
