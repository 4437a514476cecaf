#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    mcpdock_bridge::{BridgeClient, LocalServices},
    mcpdock_common::{
        ConnectionType, DeploymentState, FailureReason, PluginId, PluginMetadata, ServerConfig,
    },
    mcpdock_config::InstallSettings,
    mcpdock_deploy::{
        CommandOutcome, CommandRunner, DeployError, DeployRequest, Deployer,
        ManifestCommandGenerator, OutputLine,
    },
    mcpdock_hub::PluginRepository,
    mcpdock_install::Installer,
    mcpdock_store::ConfigStore,
    mockito::{Matcher, ServerGuard},
    tokio::sync::broadcast,
    tokio_util::sync::CancellationToken,
};

/// Succeeds every command and counts spawns.
#[derive(Default)]
struct CountingRunner {
    spawns: AtomicUsize,
}

#[async_trait]
impl CommandRunner for CountingRunner {
    async fn run(
        &self,
        _id: &PluginId,
        _command: &str,
        _cwd: &Path,
        _env: &BTreeMap<String, String>,
        _sink: &broadcast::Sender<OutputLine>,
        _cancel: CancellationToken,
    ) -> mcpdock_deploy::Result<CommandOutcome> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutcome::Exited {
            exit_code: 0,
            output: String::new(),
        })
    }
}

struct Harness {
    repo: PluginRepository,
    runner: Arc<CountingRunner>,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let plugins_dir = tmp.path().join("plugins");
    std::fs::create_dir_all(&plugins_dir).unwrap();

    let store = Arc::new(ConfigStore::in_memory());
    let installer = Arc::new(Installer::new(
        Arc::clone(&store),
        plugins_dir.clone(),
        &InstallSettings::default(),
    ));
    let runner = Arc::new(CountingRunner::default());
    let deployer = Arc::new(Deployer::new(
        Arc::clone(&store),
        plugins_dir,
        Arc::new(ManifestCommandGenerator),
        runner.clone(),
    ));
    let timeout = Duration::from_secs(2);
    let bridge = Arc::new(BridgeClient::with_timeouts(
        Arc::new(LocalServices::new(timeout)),
        timeout,
        Duration::from_secs(60),
    ));

    Harness {
        repo: PluginRepository::from_parts(store, installer, deployer, bridge),
        runner,
        _tmp: tmp,
    }
}

fn id(s: &str) -> PluginId {
    PluginId::new(s).unwrap()
}

fn write_sandbox(repo: &PluginRepository, name: &str, descriptor: &str) {
    let dir = repo.plugins_dir().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("mcp-plugin.json"), descriptor).unwrap();
}

async fn mcp_server(tools: &[&str]) -> ServerGuard {
    let mut server = mockito::Server::new_async().await;
    let tools: Vec<_> = tools
        .iter()
        .map(|t| serde_json::json!({"name": t, "inputSchema": {}}))
        .collect();
    server
        .mock("POST", "/")
        .match_body(Matcher::PartialJsonString(r#"{"method":"initialize"}"#.into()))
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock"}}}"#,
        )
        .create_async()
        .await;
    server
        .mock("POST", "/")
        .match_body(Matcher::PartialJsonString(
            r#"{"method":"notifications/initialized"}"#.into(),
        ))
        .with_status(202)
        .create_async()
        .await;
    server
        .mock("POST", "/")
        .match_body(Matcher::PartialJsonString(r#"{"method":"tools/list"}"#.into()))
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({"jsonrpc":"2.0","id":2,"result":{"tools":tools}}).to_string())
        .create_async()
        .await;
    server
}

#[tokio::test]
async fn test_weather_merge_becomes_visible() {
    let h = harness();
    let outcome = h
        .repo
        .merge_from_json(r#"{"mcpServers":{"weather":{"command":"node","args":["server.js"]}}}"#)
        .await
        .unwrap();
    assert_eq!(outcome.count, 1);
    assert!(h.repo.visible_ids().await.contains(&id("weather")));

    let rows = h.repo.plugins().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id("weather"));
    assert!(rows[0].enabled);
    assert!(!rows[0].installed);
    assert_eq!(rows[0].deployment, DeploymentState::NotDeployed);
}

#[tokio::test]
async fn test_weather_deploy_without_required_key_fails_before_spawning() {
    let h = harness();
    write_sandbox(
        &h.repo,
        "weather",
        r#"{"name":"weather","command":"node","args":["server.js"],
            "env":[{"name":"WEATHER_API_KEY","required":true}],
            "deploy":["npm ci"]}"#,
    );
    h.repo
        .merge_from_json(
            r#"{"mcpServers":{"weather":{"command":"node","args":["server.js"],
                "env":[{"name":"WEATHER_API_KEY","required":true}]}}}"#,
        )
        .await
        .unwrap();

    let weather = id("weather");
    let err = h
        .repo
        .deploy(&weather, DeployRequest::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, DeployError::MissingRequiredEnv { ref names } if names == &["WEATHER_API_KEY"])
    );
    assert!(matches!(
        h.repo.deployment_state(&weather).await,
        DeploymentState::Failed {
            reason: FailureReason::MissingRequiredEnv { .. }
        }
    ));
    assert_eq!(h.runner.spawns.load(Ordering::SeqCst), 0);

    let request = DeployRequest {
        env: BTreeMap::from([("WEATHER_API_KEY".to_string(), "k".to_string())]),
        ..Default::default()
    };
    let state = h.repo.deploy_and_wait(&weather, request).await.unwrap();
    assert_eq!(state, DeploymentState::Success);
    assert_eq!(h.runner.spawns.load(Ordering::SeqCst), 1);
    let server = h.repo.snapshot().server(&weather).cloned().unwrap();
    assert_eq!(server.env_values["WEATHER_API_KEY"], "k");
}

#[tokio::test]
async fn test_frozen_order_is_patched_not_resorted() {
    let h = harness();
    let a_server = mcp_server(&["search"]).await;
    let (a, b) = (id("a"), id("b"));

    h.repo
        .add_remote_server(
            &a,
            PluginMetadata::remote("Zeta", a_server.url(), ConnectionType::HttpStream, None),
        )
        .await
        .unwrap();
    h.repo
        .add_remote_server(
            &b,
            PluginMetadata::remote(
                "Alpha",
                "http://127.0.0.1:1/mcp",
                ConnectionType::HttpStream,
                None,
            ),
        )
        .await
        .unwrap();

    h.repo.refresh(false).await;
    let rows = h.repo.plugins().await;
    let order: Vec<_> = rows.iter().map(|r| r.id.clone()).collect();
    assert_eq!(order, vec![a.clone(), b.clone()]);
    assert!(rows[0].tools.is_some());
    assert!(rows[1].tools.is_none());

    // b's capabilities load later; the frozen list only patches b's row.
    let b_server = mcp_server(&["lookup"]).await;
    h.repo
        .update_remote_server(
            &b,
            PluginMetadata::remote("Alpha", b_server.url(), ConnectionType::HttpStream, None),
        )
        .await
        .unwrap();
    h.repo.refresh(false).await;
    let rows = h.repo.plugins().await;
    let order: Vec<_> = rows.iter().map(|r| r.id.clone()).collect();
    assert_eq!(order, vec![a.clone(), b.clone()]);
    assert_eq!(rows[1].tools.as_deref(), Some(&["lookup".to_string()][..]));

    // A manual refresh re-sorts by name.
    h.repo.refresh(true).await;
    let order: Vec<_> = h.repo.plugins().await.into_iter().map(|r| r.id).collect();
    assert_eq!(order, vec![b, a]);
}

#[tokio::test]
async fn test_tool_map_skips_disabled_plugins() {
    let h = harness();
    let server = mcp_server(&["forecast"]).await;
    let weather = h
        .repo
        .connect_remote(PluginMetadata::remote(
            "weather",
            server.url(),
            ConnectionType::HttpStream,
            Some("token".into()),
        ))
        .await
        .unwrap();

    h.repo.refresh(true).await;
    assert_eq!(h.repo.tool_map()[&weather], vec!["forecast"]);

    h.repo.set_enabled(&weather, false).await.unwrap();
    assert!(h.repo.tool_map().is_empty());
}

#[tokio::test]
async fn test_uninstall_unknown_id_changes_nothing() {
    let h = harness();
    h.repo
        .merge_from_json(r#"{"mcpServers":{"weather":{"command":"node"}}}"#)
        .await
        .unwrap();
    let before = h.repo.snapshot();

    let removed = h.repo.uninstall(&id("ghost")).await.unwrap();
    assert!(!removed);
    assert_eq!(*before, *h.repo.snapshot());
}

#[tokio::test]
async fn test_uninstall_removes_sandbox_and_entries() {
    let h = harness();
    write_sandbox(&h.repo, "notes", r#"{"name":"notes","command":"node"}"#);
    h.repo.refresh(false).await;
    let notes = id("notes");
    assert!(h.repo.snapshot().metadata(&notes).is_some());

    assert!(h.repo.uninstall(&notes).await.unwrap());
    assert!(!h.repo.plugins_dir().join("notes").exists());
    assert!(!h.repo.visible_ids().await.contains(&notes));
}

#[tokio::test]
async fn test_discovered_sandbox_is_registered_on_refresh() {
    let h = harness();
    write_sandbox(&h.repo, "notes", r#"{"name":"Notes","description":"d","command":"node"}"#);

    let rows = h.repo.plugins().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].installed);

    h.repo.refresh(false).await;
    let meta = h.repo.snapshot().metadata(&id("notes")).cloned().unwrap();
    assert_eq!(meta.name, "Notes");
    assert!(meta.is_installed);
}

#[tokio::test]
async fn test_import_overwriting_launch_config_drops_cached_commands() {
    let h = harness();
    write_sandbox(
        &h.repo,
        "weather",
        r#"{"name":"weather","command":"node","args":["a.js"],"deploy":["npm ci"]}"#,
    );
    let weather = id("weather");
    assert_eq!(h.repo.get_deploy_commands(&weather).await.unwrap(), vec!["npm ci"]);
    assert!(h.repo.deployer().cached_commands(&weather).await.is_some());

    let outcome = h
        .repo
        .merge_from_json(r#"{"mcpServers":{"weather":{"command":"node","args":["b.js"]}}}"#)
        .await
        .unwrap();
    assert!(outcome.server_config_overwritten.contains(&weather));
    assert!(h.repo.deployer().cached_commands(&weather).await.is_none());
}

/// Answers `initialize` and one `tools/list` over stdio, then idles.
const STDIO_SERVER: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"notes"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"search_notes"}]}}'
cat > /dev/null
"#;

#[cfg(unix)]
#[tokio::test]
async fn test_refresh_starts_deployed_local_services() {
    let h = harness();
    write_sandbox(&h.repo, "notes", r#"{"name":"notes","command":"sh","args":["server.sh"]}"#);
    std::fs::write(h.repo.plugins_dir().join("notes").join("server.sh"), STDIO_SERVER).unwrap();
    let notes = id("notes");
    h.repo
        .store()
        .set_server_config(&notes, ServerConfig::new("sh", vec!["server.sh".into()]))
        .await
        .unwrap();
    h.repo.store().mark_deployed(&notes, BTreeMap::new()).await.unwrap();
    assert!(h.repo.bridge().local().running().await.is_empty());

    h.repo.refresh(true).await;
    assert_eq!(h.repo.tool_map()[&notes], vec!["search_notes"]);
    assert!(h.repo.bridge().local().status(&notes).await.active);

    // A stopped service comes back on the next refresh.
    assert!(h.repo.stop_service(&notes).await);
    h.repo.refresh(true).await;
    assert!(h.repo.bridge().local().status(&notes).await.active);
    h.repo.shutdown().await;
}

#[tokio::test]
async fn test_refresh_does_not_start_undeployed_plugins() {
    let h = harness();
    write_sandbox(&h.repo, "notes", r#"{"name":"notes","command":"sh","args":["server.sh"]}"#);
    h.repo
        .store()
        .set_server_config(&id("notes"), ServerConfig::new("sh", vec!["server.sh".into()]))
        .await
        .unwrap();

    h.repo.refresh(true).await;
    assert!(h.repo.bridge().local().running().await.is_empty());
    assert!(h.repo.tool_map().is_empty());
}
