//! Supervision of running local plugin services.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::Duration,
};

use {
    mcpdock_common::{PluginId, PluginTarget, RunningStatus, ServerConfig, now_ms},
    tokio::{
        sync::{Mutex, RwLock},
        time::Instant,
    },
    tracing::{debug, info, warn},
};

use crate::{client::McpClient, error::Result, traits::McpTransport, transport::StdioTransport};

const BASE_RESTART_BACKOFF: Duration = Duration::from_secs(5);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(300);

struct RestartState {
    failures: u32,
    last_attempt: Instant,
}

impl RestartState {
    fn backoff(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        std::cmp::min(BASE_RESTART_BACKOFF * 2u32.pow(exp), MAX_RESTART_BACKOFF)
    }
}

/// Keeps one initialized stdio session per running local plugin.
pub struct LocalServices {
    request_timeout: Duration,
    services: RwLock<HashMap<PluginId, Arc<McpClient>>>,
    restarts: Mutex<HashMap<PluginId, RestartState>>,
}

impl LocalServices {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            services: RwLock::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    /// Start the local service behind `target` unless it already runs.
    /// Returns whether a service is running afterwards.
    ///
    /// After a failed launch further attempts wait out an exponential
    /// backoff; `force` skips the wait.
    pub async fn ensure_started(&self, id: &PluginId, target: &PluginTarget, force: bool) -> bool {
        if !matches!(target, PluginTarget::Local { .. }) {
            return false;
        }
        if self.client(id).await.is_some() {
            return true;
        }
        if !force
            && let Some(state) = self.restarts.lock().await.get(id)
            && state.last_attempt.elapsed() < state.backoff()
        {
            debug!(plugin = %id, failures = state.failures, "service launch backing off");
            return false;
        }

        match self.start_target(id, target).await {
            Ok(()) => {
                self.restarts.lock().await.remove(id);
                true
            },
            Err(e) => {
                let mut restarts = self.restarts.lock().await;
                let state = restarts.entry(id.clone()).or_insert(RestartState {
                    failures: 0,
                    last_attempt: Instant::now(),
                });
                state.failures += 1;
                state.last_attempt = Instant::now();
                warn!(
                    plugin = %id,
                    error = %e,
                    failures = state.failures,
                    "failed to start local service"
                );
                false
            },
        }
    }

    /// Launch the plugin's service in its sandbox, replacing a running instance.
    pub async fn start(&self, id: &PluginId, sandbox: &Path, server: &ServerConfig) -> Result<()> {
        self.stop(id).await;

        let env = launch_env(server);
        let transport = StdioTransport::spawn(
            &server.command,
            &server.args,
            sandbox,
            &env,
            self.request_timeout,
        )
        .await?;

        let client = match McpClient::initialize(id.as_str(), transport.clone()).await {
            Ok(client) => client,
            Err(e) => {
                transport.kill().await;
                return Err(e);
            },
        };

        info!(plugin = %id, command = %server.command, "local service started");
        self.services
            .write()
            .await
            .insert(id.clone(), Arc::new(client));
        Ok(())
    }

    /// Start the service behind `target` when it is local. Remote targets
    /// have nothing to launch.
    pub async fn start_target(&self, id: &PluginId, target: &PluginTarget) -> Result<()> {
        match target {
            PluginTarget::Local {
                sandbox_path,
                command,
            } => self.start(id, sandbox_path, command).await,
            PluginTarget::Remote { .. } => Ok(()),
        }
    }

    /// Stop the service if it runs. Returns whether one was running.
    pub async fn stop(&self, id: &PluginId) -> bool {
        self.restarts.lock().await.remove(id);
        let Some(client) = self.services.write().await.remove(id) else {
            return false;
        };
        client.shutdown().await;
        info!(plugin = %id, "local service stopped");
        true
    }

    /// The live session for `id`. An exited process is dropped from the table.
    pub async fn client(&self, id: &PluginId) -> Option<Arc<McpClient>> {
        let client = self.services.read().await.get(id).cloned()?;
        if client.is_alive().await {
            return Some(client);
        }
        warn!(plugin = %id, "local service exited");
        self.services.write().await.remove(id);
        None
    }

    pub async fn status(&self, id: &PluginId) -> RunningStatus {
        RunningStatus {
            active: self.client(id).await.is_some(),
            last_checked_ms: now_ms(),
        }
    }

    pub async fn running(&self) -> Vec<PluginId> {
        let mut ids: Vec<_> = self.services.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.services.write().await.drain().collect();
        for (id, client) in drained {
            client.shutdown().await;
            info!(plugin = %id, "local service stopped");
        }
    }
}

/// Values captured at deploy time, falling back to declared defaults.
fn launch_env(server: &ServerConfig) -> BTreeMap<String, String> {
    let mut env = server.env_values.clone();
    for spec in &server.env {
        if let Some(default) = &spec.default {
            env.entry(spec.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    env
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use {super::*, mcpdock_common::EnvVarSpec};

    /// A one-shot MCP server in shell: answers `initialize` (id 1) and the
    /// first `tools/list` (id 2), then idles.
    const FAKE_SERVER: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake"}}}'
read line
read line
echo "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[{\"name\":\"$TOOL_NAME\"}]}}"
cat > /dev/null
"#;

    fn fake_server(dir: &Path) -> ServerConfig {
        std::fs::write(dir.join("server.sh"), FAKE_SERVER).unwrap();
        let mut server = ServerConfig::new("sh", vec!["server.sh".into()]);
        server.env = vec![EnvVarSpec::optional("TOOL_NAME", Some("forecast".into()))];
        server
    }

    #[test]
    fn test_launch_env_prefers_captured_values() {
        let mut server = ServerConfig::new("x", vec![]);
        server.env = vec![
            EnvVarSpec::optional("A", Some("default-a".into())),
            EnvVarSpec::optional("B", Some("default-b".into())),
        ];
        server.env_values.insert("A".into(), "deployed-a".into());
        let env = launch_env(&server);
        assert_eq!(env["A"], "deployed-a");
        assert_eq!(env["B"], "default-b");
    }

    #[tokio::test]
    async fn test_start_list_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let id = PluginId::new("weather").unwrap();
        let services = LocalServices::new(Duration::from_secs(5));

        services.start(&id, tmp.path(), &fake_server(tmp.path())).await.unwrap();
        assert!(services.status(&id).await.active);
        assert_eq!(services.running().await, vec![id.clone()]);

        let client = services.client(&id).await.unwrap();
        assert_eq!(client.tool_names().await.unwrap(), vec!["forecast"]);

        assert!(services.stop(&id).await);
        assert!(!services.status(&id).await.active);
        assert!(!services.stop(&id).await);
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_nothing_running() {
        let tmp = tempfile::tempdir().unwrap();
        let id = PluginId::new("broken").unwrap();
        let services = LocalServices::new(Duration::from_millis(300));
        let server = ServerConfig::new("sh", vec!["-c".into(), "exit 1".into()]);

        assert!(services.start(&id, tmp.path(), &server).await.is_err());
        assert!(services.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let tmp = tempfile::tempdir().unwrap();
        let services = LocalServices::new(Duration::from_secs(5));
        let server = fake_server(tmp.path());
        for name in ["a", "b"] {
            let id = PluginId::new(name).unwrap();
            services.start(&id, tmp.path(), &server).await.unwrap();
        }
        services.shutdown_all().await;
        assert!(services.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_started_launches_once() {
        let tmp = tempfile::tempdir().unwrap();
        let id = PluginId::new("weather").unwrap();
        let services = LocalServices::new(Duration::from_secs(5));
        let target = PluginTarget::Local {
            sandbox_path: tmp.path().to_path_buf(),
            command: fake_server(tmp.path()),
        };

        assert!(services.ensure_started(&id, &target, false).await);
        let first = services.client(&id).await.unwrap();
        assert!(services.ensure_started(&id, &target, false).await);
        assert!(Arc::ptr_eq(&first, &services.client(&id).await.unwrap()));
        services.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_failed_launch_backs_off_unless_forced() {
        let tmp = tempfile::tempdir().unwrap();
        let id = PluginId::new("broken").unwrap();
        let services = LocalServices::new(Duration::from_millis(300));
        let marker = tmp.path().join("attempts");
        let target = PluginTarget::Local {
            sandbox_path: tmp.path().to_path_buf(),
            command: ServerConfig::new(
                "sh",
                vec!["-c".into(), format!("echo x >> {}; exit 1", marker.display())],
            ),
        };
        let attempts = || std::fs::read_to_string(&marker).unwrap_or_default().lines().count();

        assert!(!services.ensure_started(&id, &target, false).await);
        assert_eq!(attempts(), 1);
        assert!(!services.ensure_started(&id, &target, false).await);
        assert_eq!(attempts(), 1);
        assert!(!services.ensure_started(&id, &target, true).await);
        assert_eq!(attempts(), 2);
    }

    #[tokio::test]
    async fn test_ensure_started_ignores_remote_targets() {
        let services = LocalServices::new(Duration::from_secs(1));
        let target = PluginTarget::Remote {
            endpoint: "http://127.0.0.1:1/mcp".into(),
            connection_type: mcpdock_common::ConnectionType::HttpStream,
            token: None,
        };
        let id = PluginId::new("remote").unwrap();
        assert!(!services.ensure_started(&id, &target, true).await);
        assert!(services.running().await.is_empty());
    }
}
