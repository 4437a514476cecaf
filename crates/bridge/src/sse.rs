//! Legacy HTTP+SSE transport for remote MCP endpoints (`connectionType=sse`).
//!
//! The client opens a GET event stream, waits for the `endpoint` event naming
//! the URL to POST messages to, and reads responses back from `message` events.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    reqwest::Client,
    secrecy::{ExposeSecret, Secret},
    tokio::{
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, trace, warn},
    url::Url,
};

use crate::{
    error::{BridgeError, Result},
    http::{MCP_PROTOCOL_VERSION_HEADER, reject_auth},
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION},
};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser fed with raw body chunks.
#[derive(Debug, Default)]
pub(crate) struct EventParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(SseEvent {
                        event: self.event.take().unwrap_or_else(|| "message".into()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                self.event = None;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {},
            }
        }
        out
    }
}

pub struct SseTransport {
    client: Client,
    url: String,
    endpoint: Url,
    token: Option<Secret<String>>,
    next_id: AtomicU64,
    pending: Pending,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its message
    /// endpoint, bounded by `timeout`.
    pub async fn connect(
        url: &str,
        token: Option<Secret<String>>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let base = Url::parse(url).map_err(|e| BridgeError::Unreachable {
            endpoint: url.to_string(),
            message: e.to_string(),
        })?;
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BridgeError::external("failed to build HTTP client", e))?;

        let mut req = client
            .get(url)
            .header("Accept", "text/event-stream")
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        if let Some(token) = &token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BridgeError::from_http(url, "connect", e))?;
        reject_auth(url, resp.status())?;
        if !resp.status().is_success() {
            return Err(BridgeError::protocol(format!(
                "HTTP {} opening event stream",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut parser = EventParser::default();
        let announce = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| BridgeError::from_http(url, "connect", e))?;
                let mut events = parser.push(&chunk).into_iter();
                if let Some(ev) = events.by_ref().find(|ev| ev.event == "endpoint") {
                    return Ok((ev.data, events.collect::<Vec<_>>()));
                }
            }
            Err(BridgeError::protocol("event stream closed before `endpoint` event"))
        };
        let (path, early) = match tokio::time::timeout(timeout, announce).await {
            Ok(found) => found?,
            Err(_) => {
                return Err(BridgeError::Timeout {
                    method: "connect".into(),
                    after: timeout,
                });
            },
        };
        let endpoint = base
            .join(path.trim())
            .map_err(|e| BridgeError::protocol(format!("bad endpoint `{path}`: {e}")))?;
        debug!(%url, endpoint = %endpoint, "SSE endpoint announced");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = {
            let pending = Arc::clone(&pending);
            let url = url.to_string();
            tokio::spawn(async move {
                dispatch(&pending, early).await;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => dispatch(&pending, parser.push(&chunk)).await,
                        Err(e) => {
                            warn!(%url, error = %e, "SSE stream failed");
                            break;
                        },
                    }
                }
                debug!(%url, "SSE stream closed");
                pending.lock().await.clear();
            })
        };

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            endpoint,
            token,
            next_id: AtomicU64::new(1),
            pending,
            request_timeout: timeout,
            reader,
        }))
    }

    async fn post(&self, method: &str, body: &impl serde::Serialize) -> Result<()> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.request_timeout)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .json(body);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BridgeError::from_http(&self.url, method, e))?;
        reject_auth(&self.url, resp.status())?;
        if !resp.status().is_success() {
            return Err(BridgeError::protocol(format!(
                "HTTP {} posting '{method}'",
                resp.status()
            )));
        }
        Ok(())
    }
}

async fn dispatch(pending: &Pending, events: Vec<SseEvent>) {
    for ev in events.into_iter().filter(|ev| ev.event == "message") {
        trace!(data = %ev.data, "SSE server -> client");
        match serde_json::from_str::<JsonRpcResponse>(&ev.data) {
            Ok(resp) => {
                if let Some(tx) = pending.lock().await.remove(&resp.id_key()) {
                    let _ = tx.send(resp);
                }
            },
            Err(e) => debug!(error = %e, "SSE message is not a response"),
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let key = req.id.to_string();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|_, tx| !tx.is_closed());
            pending.insert(key.clone(), tx);
        }
        debug!(%method, %id, url = %self.url, "SSE client -> server");

        if let Err(e) = self.post(method, &req).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(BridgeError::protocol(format!(
                    "event stream closed while waiting for '{method}'"
                )));
            },
            Err(_) => {
                self.pending.lock().await.remove(&key);
                return Err(BridgeError::Timeout {
                    method: method.to_string(),
                    after: self.request_timeout,
                });
            },
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
        self.post(method, &JsonRpcNotification::new(method, params))
            .await
    }

    async fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    async fn kill(&self) {
        self.reader.abort();
    }
}
