//! `PluginRepository`: the single context object behind every plugin operation.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::Context as _,
    futures::future::join_all,
    mcpdock_bridge::{BridgeClient, BridgeError, LocalServices},
    mcpdock_common::{
        CapabilitySnapshot, DeploymentState, InstallProgress, PluginId, PluginMetadata,
        PluginTarget, PluginType, RunningStatus, now_ms,
    },
    mcpdock_config::HubConfig,
    mcpdock_deploy::{
        DeployError, DeployEvent, DeployRequest, Deployer, ManifestCommandGenerator, OutputLine,
        ShellRunner,
    },
    mcpdock_install::{InstallError, Installer},
    mcpdock_store::{ConfigDocument, ConfigStore, FileBackend, MergeOutcome, StoreError},
    serde::Serialize,
    tokio::{
        sync::{Mutex, broadcast, watch},
        task::JoinHandle,
    },
    tokio_stream::wrappers::WatchStream,
    tracing::{debug, info, warn},
};

use crate::reconcile::{OrderCache, OrderKey, Readiness, visible_ids};

/// One row of the plugin list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginView {
    pub id: PluginId,
    pub display_name: String,
    pub plugin_type: PluginType,
    pub enabled: bool,
    pub installed: bool,
    pub deployed: bool,
    pub deployment: DeploymentState,
    pub running: RunningStatus,
    /// Last known tool names; `None` until the first successful query.
    pub tools: Option<Vec<String>>,
}

#[derive(Default)]
struct OrderState {
    cache: OrderCache,
    /// Visible set for which capability discovery last completed.
    settled_for: Option<BTreeSet<PluginId>>,
}

pub struct PluginRepository {
    plugins_dir: PathBuf,
    store: Arc<ConfigStore>,
    installer: Arc<Installer>,
    deployer: Arc<Deployer>,
    bridge: Arc<BridgeClient>,
    order: Mutex<OrderState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginRepository {
    /// Build every component from settings, backed by files under the data dir.
    pub async fn open(config: &HubConfig) -> anyhow::Result<Self> {
        let plugins_dir = mcpdock_config::plugins_dir(config);
        tokio::fs::create_dir_all(&plugins_dir)
            .await
            .with_context(|| format!("failed to create {}", plugins_dir.display()))?;

        let store_path = mcpdock_config::store_path(config);
        let store = ConfigStore::open(Arc::new(FileBackend::new(&store_path)))
            .await
            .with_context(|| format!("failed to open {}", store_path.display()))?;
        let store = Arc::new(store);

        let installer = Arc::new(Installer::new(
            Arc::clone(&store),
            plugins_dir.clone(),
            &config.install,
        ));
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&store),
            plugins_dir.clone(),
            Arc::new(ManifestCommandGenerator),
            Arc::new(ShellRunner::new(config.deploy.shell.clone())),
        ));
        let local = Arc::new(LocalServices::new(Duration::from_secs(
            config.bridge.timeout_secs,
        )));
        let bridge = Arc::new(BridgeClient::new(local, &config.bridge));

        info!(
            store = %store_path.display(),
            plugins = %plugins_dir.display(),
            "plugin repository opened"
        );
        Ok(Self::from_parts(store, installer, deployer, bridge))
    }

    /// Assemble from existing components. Must be called inside a Tokio
    /// runtime: it starts the sandbox cleanup listener and the task that
    /// launches a plugin's service after a successful deploy.
    pub fn from_parts(
        store: Arc<ConfigStore>,
        installer: Arc<Installer>,
        deployer: Arc<Deployer>,
        bridge: Arc<BridgeClient>,
    ) -> Self {
        let plugins_dir = installer.plugins_dir().to_path_buf();
        let tasks = vec![
            installer.spawn_cleanup_listener(),
            spawn_deploy_follower(
                Arc::clone(&store),
                Arc::clone(&bridge),
                plugins_dir.clone(),
                deployer.events(),
            ),
        ];
        Self {
            plugins_dir,
            store,
            installer,
            deployer,
            bridge,
            order: Mutex::new(OrderState::default()),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn bridge(&self) -> &Arc<BridgeClient> {
        &self.bridge
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    // ── Config ──────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<ConfigDocument> {
        self.store.snapshot()
    }

    /// Document snapshots after each committed write. Latest-wins.
    pub fn subscribe(&self) -> WatchStream<Arc<ConfigDocument>> {
        self.store.subscribe()
    }

    pub async fn set_enabled(&self, id: &PluginId, enabled: bool) -> Result<(), StoreError> {
        self.store.set_enabled(id, enabled).await
    }

    /// Merge an imported document. Cached deploy commands of every plugin
    /// whose launch config changed are dropped so the next deploy regenerates
    /// them.
    pub async fn merge_from_json(&self, text: &str) -> Result<MergeOutcome, StoreError> {
        let outcome = self.store.merge_from_json(text).await?;
        for id in &outcome.server_config_overwritten {
            debug!(plugin = %id, "launch config overwritten, dropping cached deploy commands");
            self.deployer.invalidate_commands(id).await;
        }
        Ok(outcome)
    }

    pub async fn save_plugin_config(&self, id: &PluginId, text: &str) -> Result<(), StoreError> {
        self.store.save_plugin_config(id, text).await
    }

    pub fn plugin_config(&self, id: &PluginId) -> Option<String> {
        self.store.plugin_config(id)
    }

    pub async fn add_remote_server(
        &self,
        id: &PluginId,
        metadata: PluginMetadata,
    ) -> Result<(), StoreError> {
        self.store.add_remote_server(id, metadata).await
    }

    pub async fn update_remote_server(
        &self,
        id: &PluginId,
        metadata: PluginMetadata,
    ) -> Result<(), StoreError> {
        self.store.update_remote_server(id, metadata).await?;
        // Endpoint or token may have changed.
        self.bridge.forget(id).await;
        Ok(())
    }

    // ── Install ─────────────────────────────────────────────────────────

    pub async fn install_from_repo(
        &self,
        source: &str,
        id: Option<PluginId>,
    ) -> Result<PluginId, InstallError> {
        self.installer.install_from_repo(source, id).await
    }

    pub async fn install_from_zip(
        &self,
        metadata: PluginMetadata,
        archive: &Path,
    ) -> Result<PluginId, InstallError> {
        self.installer.install_from_zip(metadata, archive).await
    }

    pub async fn connect_remote(&self, metadata: PluginMetadata) -> Result<PluginId, InstallError> {
        self.installer.connect_remote(metadata).await
    }

    pub fn install_progress(&self) -> broadcast::Receiver<(PluginId, InstallProgress)> {
        self.installer.progress()
    }

    /// Stop everything running for `id`, then remove its sandbox and entries.
    /// An unknown id is a no-op.
    pub async fn uninstall(&self, id: &PluginId) -> Result<bool, InstallError> {
        if self.deployer.cancel(id).await {
            info!(plugin = %id, "cancelled deployment before uninstall");
        }
        self.bridge.local().stop(id).await;
        let removed = self.installer.uninstall(id).await?;
        if removed {
            self.deployer.forget(id).await;
            self.bridge.forget(id).await;
        }
        Ok(removed)
    }

    // ── Deploy ──────────────────────────────────────────────────────────

    pub async fn get_deploy_commands(&self, id: &PluginId) -> Result<Vec<String>, DeployError> {
        self.deployer.get_deploy_commands(id).await
    }

    pub async fn deploy(&self, id: &PluginId, request: DeployRequest) -> Result<(), DeployError> {
        self.deployer.deploy(id, request).await
    }

    pub async fn deploy_and_wait(
        &self,
        id: &PluginId,
        request: DeployRequest,
    ) -> Result<DeploymentState, DeployError> {
        self.deployer.deploy_and_wait(id, request).await
    }

    pub async fn cancel_deploy(&self, id: &PluginId) -> bool {
        self.deployer.cancel(id).await
    }

    pub async fn retry_deploy(&self, id: &PluginId) -> Result<(), DeployError> {
        self.deployer.retry(id).await
    }

    pub async fn deployment_state(&self, id: &PluginId) -> DeploymentState {
        self.deployer.state(id).await
    }

    pub fn deploy_events(&self) -> broadcast::Receiver<DeployEvent> {
        self.deployer.events()
    }

    pub fn deploy_output(&self) -> broadcast::Receiver<OutputLine> {
        self.deployer.output()
    }

    // ── Services and capabilities ───────────────────────────────────────

    /// Launch a local plugin's service and load its capabilities.
    pub async fn start_service(&self, id: &PluginId) -> Result<Option<Vec<String>>, BridgeError> {
        let target = self
            .store
            .snapshot()
            .target(id, &self.plugins_dir)
            .ok_or_else(|| BridgeError::message(format!("plugin '{id}' has no launch config")))?;
        self.bridge.local().start_target(id, &target).await?;
        Ok(self.bridge.get_service_info(id, &target).await)
    }

    pub async fn stop_service(&self, id: &PluginId) -> bool {
        self.bridge.local().stop(id).await
    }

    /// Query one plugin now, bypassing backoff.
    pub async fn get_service_info(&self, id: &PluginId) -> Option<Vec<String>> {
        let target = self.store.snapshot().target(id, &self.plugins_dir)?;
        self.bridge.get_service_info(id, &target).await
    }

    /// Capability snapshots after each change. Latest-wins.
    pub fn capabilities(&self) -> watch::Receiver<CapabilitySnapshot> {
        self.bridge.subscribe()
    }

    /// `{id -> tool names}` of enabled plugins with loaded capabilities.
    pub fn tool_map(&self) -> BTreeMap<PluginId, Vec<String>> {
        let doc = self.store.snapshot();
        self.bridge
            .snapshot()
            .into_iter()
            .filter(|(id, _)| doc.is_enabled(id))
            .collect()
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    async fn discovered(&self) -> BTreeSet<PluginId> {
        match self.installer.discover_installed().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "sandbox discovery failed");
                BTreeSet::new()
            },
        }
    }

    pub async fn visible_ids(&self) -> BTreeSet<PluginId> {
        let doc = self.store.snapshot();
        visible_ids(
            &doc.configured_ids(),
            &doc.remote_ids(),
            &self.discovered().await,
        )
    }

    /// Register plugins found on disk, start the services of deployed local
    /// plugins that are not running, then query every enabled plugin.
    ///
    /// A manual refresh also re-sorts the list and ignores backoff. Failures
    /// are logged and leave cached data in place.
    pub async fn refresh(&self, manual: bool) -> CapabilitySnapshot {
        match self.installer.register_unregistered().await {
            Ok(added) if !added.is_empty() => {
                info!(count = added.len(), "registered plugins found on disk");
            },
            Ok(_) => {},
            Err(e) => warn!(error = %e, "registering discovered plugins failed"),
        }
        if manual {
            self.order.lock().await.cache.invalidate();
        }

        let visible = self.visible_ids().await;
        let doc = self.store.snapshot();
        let targets: Vec<(PluginId, PluginTarget)> = visible
            .iter()
            .filter(|id| doc.is_enabled(id))
            .filter_map(|id| {
                doc.target(id, &self.plugins_dir)
                    .map(|target| (id.clone(), target))
            })
            .collect();

        // Deployed local plugins get their service back after a restart or crash.
        join_all(
            targets
                .iter()
                .filter(|(id, target)| {
                    matches!(target, PluginTarget::Local { .. })
                        && doc.metadata(id).is_some_and(|m| m.is_deployed)
                })
                .map(|(id, target)| self.bridge.local().ensure_started(id, target, manual)),
        )
        .await;

        let snapshot = self.bridge.refresh_all(&targets, manual).await;
        self.order.lock().await.settled_for = Some(visible);
        debug!(plugins = targets.len(), loaded = snapshot.len(), manual, "refresh complete");
        snapshot
    }

    /// Every visible plugin in display order.
    pub async fn plugins(&self) -> Vec<PluginView> {
        let doc = self.store.snapshot();
        let discovered = self.discovered().await;
        let visible = visible_ids(&doc.configured_ids(), &doc.remote_ids(), &discovered);
        let capabilities = self.bridge.snapshot();

        let mut rows = BTreeMap::new();
        for id in &visible {
            let view = self.view(&doc, id, discovered.contains(id), &capabilities).await;
            rows.insert(id.clone(), view);
        }

        let keys: Vec<_> = rows
            .values()
            .map(|v| OrderKey {
                id: v.id.clone(),
                display_name: v.display_name.clone(),
                readiness: Readiness::of(v.enabled, v.tools.is_some()),
            })
            .collect();
        let order = {
            let mut state = self.order.lock().await;
            let settled = state.settled_for.as_ref() == Some(&visible);
            state.cache.order(&keys, settled)
        };
        order.into_iter().filter_map(|id| rows.remove(&id)).collect()
    }

    async fn view(
        &self,
        doc: &ConfigDocument,
        id: &PluginId,
        on_disk: bool,
        capabilities: &CapabilitySnapshot,
    ) -> PluginView {
        let meta = doc.metadata(id);
        let tools = capabilities.get(id).cloned();
        let plugin_type = meta.map(|m| m.plugin_type).unwrap_or_default();
        let running = match plugin_type {
            PluginType::Local => self.bridge.local().status(id).await,
            PluginType::Remote => RunningStatus {
                active: tools.is_some(),
                last_checked_ms: now_ms(),
            },
        };
        PluginView {
            id: id.clone(),
            display_name: meta
                .map(|m| m.display_name(id).to_string())
                .unwrap_or_else(|| id.to_string()),
            plugin_type,
            enabled: doc.is_enabled(id),
            installed: on_disk || meta.is_some_and(|m| m.is_installed),
            deployed: meta.is_some_and(|m| m.is_deployed),
            deployment: self.deployer.state(id).await,
            running,
            tools,
        }
    }

    /// Stop background tasks, running deployments and local services.
    pub async fn shutdown(&self) {
        for id in self.visible_ids().await {
            if self.deployer.is_deploying(&id).await {
                self.deployer.cancel(&id).await;
            }
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.bridge.local().shutdown_all().await;
        info!("plugin repository shut down");
    }
}

/// Start the service of each freshly deployed plugin and load its tools.
fn spawn_deploy_follower(
    store: Arc<ConfigStore>,
    bridge: Arc<BridgeClient>,
    plugins_dir: PathBuf,
    mut events: broadcast::Receiver<DeployEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeployEvent::Succeeded { id }) => {
                    let Some(target) = store.snapshot().target(&id, &plugins_dir) else {
                        warn!(plugin = %id, "deployed plugin has no launch config");
                        continue;
                    };
                    if let Err(e) = bridge.local().start_target(&id, &target).await {
                        warn!(plugin = %id, error = %e, "failed to start deployed plugin");
                        continue;
                    }
                    bridge.get_service_info(&id, &target).await;
                },
                Ok(DeployEvent::StateChanged { .. }) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "deploy follower lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
