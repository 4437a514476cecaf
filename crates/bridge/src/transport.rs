//! Stdio transport: a plugin process speaking JSON-RPC over stdin/stdout.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, trace, warn},
};

use crate::{
    error::{BridgeError, Context, Result},
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn `command` inside `cwd` and start the reader loop.
    ///
    /// A relative command containing a path separator (`./target/release/x`,
    /// `.venv/bin/python`) is resolved against `cwd`.
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let program = resolve_program(command, cwd);
        info!(
            command = %program.display(),
            args = ?args,
            cwd = %cwd.display(),
            "spawning plugin service"
        );

        let mut child = Command::new(&program)
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::external(format!("failed to spawn `{command}`"), e))?;

        let stdin = child.stdin.take().context("failed to capture stdin")?;
        let stdout = child.stdout.take().context("failed to capture stdout")?;

        if let Some(stderr) = child.stderr.take() {
            let command = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        warn!(%command, stderr = %trimmed, "plugin service stderr");
                    }
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let handle = tokio::spawn(read_responses(stdout, Arc::clone(&pending)));

        Ok(Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader_handle: Mutex::new(Some(handle)),
        }))
    }

    async fn write_line(&self, payload: &impl serde::Serialize) -> Result<()> {
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

fn resolve_program(command: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

async fn read_responses(stdout: tokio::process::ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                trace!(raw = %trimmed, "plugin service -> client");
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) => {
                        let key = resp.id_key();
                        if let Some(tx) = pending.lock().await.remove(&key) {
                            let _ = tx.send(resp);
                        } else {
                            warn!(id = %key, "response for unknown request id");
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, line = %trimmed, "plugin service sent non-response line");
                    },
                }
            },
            Ok(None) => {
                debug!("plugin service stdout closed");
                break;
            },
            Err(e) => {
                warn!(error = %e, "error reading plugin service stdout");
                break;
            },
        }
    }
    // Wake every waiter; nothing more will arrive.
    pending.lock().await.clear();
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // Callers that gave up (an outer timeout) leave closed senders behind.
            pending.retain(|_, tx| !tx.is_closed());
            pending.insert(req.id.to_string(), tx);
        }

        debug!(%method, %id, "client -> plugin service");
        if let Err(e) = self.write_line(&req).await {
            self.pending.lock().await.remove(&req.id.to_string());
            return Err(e);
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(BridgeError::protocol(format!(
                    "plugin service exited while waiting for '{method}'"
                )));
            },
            Err(_) => {
                self.pending.lock().await.remove(&req.id.to_string());
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
        trace!(%method, "client -> plugin service (notification)");
        self.write_line(&JsonRpcNotification::new(method, params)).await
    }

    async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn kill(&self) {
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        let _ = self.child.lock().await.kill().await;
    }
}
