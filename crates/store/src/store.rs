//! ConfigStore: serialized whole-document writes with a snapshot stream.

use std::{collections::BTreeMap, sync::Arc};

use {
    mcpdock_common::{PluginId, PluginMetadata, ServerConfig, now_ms},
    tokio::sync::{Mutex, broadcast, watch},
    tokio_stream::wrappers::WatchStream,
    tracing::{debug, info},
};

use crate::{
    backend::{DocumentBackend, MemoryBackend},
    document::ConfigDocument,
    error::{Result, StoreError},
    import::{ImportDocument, MergeOutcome},
};

const EVENT_CAPACITY: usize = 64;

/// Structural changes other components react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PluginRemoved(PluginId),
}

/// Owner of the persisted plugin document.
///
/// Writers are serialized by one async mutex. Each write re-reads the latest
/// committed text from the backend, applies its change to that copy, commits
/// the whole document, and only then publishes the new snapshot. A write that
/// fails at any step publishes nothing.
pub struct ConfigStore {
    backend: Arc<dyn DocumentBackend>,
    write_lock: Mutex<()>,
    current: watch::Sender<Arc<ConfigDocument>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConfigStore {
    /// Open a store over `backend`, loading the committed document.
    pub async fn open(backend: Arc<dyn DocumentBackend>) -> Result<Self> {
        let reader = Arc::clone(&backend);
        let doc = tokio::task::spawn_blocking(move || load_document(reader.as_ref()))
            .await
            .map_err(|e| StoreError::external("store loader task failed", e))??;

        info!(
            servers = doc.mcp_servers.len(),
            metadata = doc.plugin_metadata.len(),
            "opened plugin store"
        );

        let (current, _) = watch::channel(Arc::new(doc));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            backend,
            write_lock: Mutex::new(()),
            current,
            events,
        })
    }

    /// Empty store backed by memory.
    pub fn in_memory() -> Self {
        let (current, _) = watch::channel(Arc::new(ConfigDocument::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend: Arc::new(MemoryBackend::new()),
            write_lock: Mutex::new(()),
            current,
            events,
        }
    }

    /// Latest committed document.
    pub fn snapshot(&self) -> Arc<ConfigDocument> {
        Arc::clone(&self.current.borrow())
    }

    /// Snapshots committed after this call.
    ///
    /// Delivery is latest-wins: a slow subscriber may skip intermediate
    /// snapshots but always converges on the newest one.
    pub fn subscribe(&self) -> WatchStream<Arc<ConfigDocument>> {
        WatchStream::from_changes(self.current.subscribe())
    }

    /// Raw watch receiver, for callers that want `changed()`/`borrow()`.
    pub fn watch(&self) -> watch::Receiver<Arc<ConfigDocument>> {
        self.current.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Run one serialized read-modify-commit cycle.
    async fn mutate<R, F>(&self, op: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let backend = Arc::clone(&self.backend);

        let (doc, out) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut doc = load_document(backend.as_ref())?;
            let before = doc.clone();
            let out = f(&mut doc)?;
            if doc != before {
                backend.commit(&doc.to_json()?)?;
            }
            Ok((doc, out))
        })
        .await
        .map_err(|e| StoreError::external("store writer task failed", e))??;

        let changed = self.current.send_if_modified(|cur| {
            if **cur == doc {
                false
            } else {
                *cur = Arc::new(doc);
                true
            }
        });
        debug!(op, changed, "store write finished");
        Ok(out)
    }

    /// Enable or disable a plugin. Only the enablement map is touched.
    pub async fn set_enabled(&self, id: &PluginId, enabled: bool) -> Result<()> {
        let id = id.clone();
        self.mutate("set_enabled", move |doc| {
            if enabled {
                doc.enablement.remove(&id);
            } else {
                doc.enablement.insert(id, false);
            }
            Ok(())
        })
        .await
    }

    /// Merge an external `{"mcpServers": …, "pluginMetadata": …}` document.
    ///
    /// All-or-nothing: a parse or shape error returns `ConfigParse` before any
    /// write is attempted.
    pub async fn merge_from_json(&self, text: &str) -> Result<MergeOutcome> {
        let import = ImportDocument::parse(text)?;
        let outcome = self
            .mutate("merge_from_json", move |doc| Ok(import.apply(doc, now_ms())))
            .await?;
        info!(
            count = outcome.count,
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            "merged plugin document"
        );
        Ok(outcome)
    }

    /// Store raw per-plugin config text verbatim. The text must be valid JSON.
    pub async fn save_plugin_config(&self, id: &PluginId, text: &str) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(text)
            .map_err(|e| StoreError::config_parse(e.to_string()))?;
        let id = id.clone();
        let text = text.to_string();
        self.mutate("save_plugin_config", move |doc| {
            doc.plugin_configs.insert(id, text);
            Ok(())
        })
        .await
    }

    pub fn plugin_config(&self, id: &PluginId) -> Option<String> {
        self.snapshot().plugin_configs.get(id).cloned()
    }

    /// Register a new remote server. Fails with `IdConflict` if the id is taken.
    pub async fn add_remote_server(&self, id: &PluginId, metadata: PluginMetadata) -> Result<()> {
        let metadata = normalize_remote(metadata)?;
        let id = id.clone();
        info!(plugin = %id, endpoint = ?metadata.endpoint, "adding remote server");
        self.mutate("add_remote_server", move |doc| {
            if doc.contains(&id) {
                return Err(StoreError::IdConflict { id });
            }
            doc.plugin_metadata.insert(id, metadata);
            Ok(())
        })
        .await
    }

    /// Edit a remote server in place, keeping its creation time.
    pub async fn update_remote_server(
        &self,
        id: &PluginId,
        metadata: PluginMetadata,
    ) -> Result<()> {
        let mut metadata = normalize_remote(metadata)?;
        let id = id.clone();
        self.mutate("update_remote_server", move |doc| {
            let existing = doc
                .plugin_metadata
                .get(&id)
                .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
            if !existing.is_remote() {
                return Err(StoreError::NotRemote { id });
            }
            metadata.created_at_ms = existing.created_at_ms;
            metadata.updated_at_ms = now_ms();
            doc.plugin_metadata.insert(id, metadata);
            Ok(())
        })
        .await
    }

    /// Remove every entry for `id`. Absent ids are a no-op.
    pub async fn remove_plugin(&self, id: &PluginId) -> Result<bool> {
        let target = id.clone();
        let removed = self
            .mutate("remove_plugin", move |doc| Ok(doc.remove(&target)))
            .await?;
        if removed {
            info!(plugin = %id, "removed plugin from store");
            let _ = self.events.send(StoreEvent::PluginRemoved(id.clone()));
        }
        Ok(removed)
    }

    /// Insert or replace a plugin's metadata.
    pub async fn upsert_metadata(&self, id: &PluginId, metadata: PluginMetadata) -> Result<()> {
        let id = id.clone();
        self.mutate("upsert_metadata", move |doc| {
            doc.plugin_metadata.insert(id, metadata);
            Ok(())
        })
        .await
    }

    /// Insert metadata only when the id is unknown. Returns whether it was added.
    pub async fn insert_metadata_if_absent(
        &self,
        id: &PluginId,
        metadata: PluginMetadata,
    ) -> Result<bool> {
        let id = id.clone();
        self.mutate("insert_metadata_if_absent", move |doc| {
            if doc.contains(&id) {
                return Ok(false);
            }
            doc.plugin_metadata.insert(id, metadata);
            Ok(true)
        })
        .await
    }

    /// Add metadata for plugins found on disk that the document does not know.
    pub async fn register_discovered(
        &self,
        found: Vec<(PluginId, PluginMetadata)>,
    ) -> Result<Vec<PluginId>> {
        self.mutate("register_discovered", move |doc| {
            let mut added = Vec::new();
            for (id, meta) in found {
                if !doc.contains(&id) {
                    doc.plugin_metadata.insert(id.clone(), meta);
                    added.push(id);
                }
            }
            Ok(added)
        })
        .await
    }

    /// Create or replace the launch config of a local plugin.
    pub async fn set_server_config(&self, id: &PluginId, config: ServerConfig) -> Result<()> {
        let id = id.clone();
        self.mutate("set_server_config", move |doc| {
            doc.mcp_servers.insert(id, config);
            Ok(())
        })
        .await
    }

    /// Record a successful deploy: the deployed flag plus the env values used.
    pub async fn mark_deployed(
        &self,
        id: &PluginId,
        env_values: BTreeMap<String, String>,
    ) -> Result<()> {
        let id = id.clone();
        self.mutate("mark_deployed", move |doc| {
            let meta = doc
                .plugin_metadata
                .entry(id.clone())
                .or_insert_with(|| PluginMetadata::local(id.as_str()));
            meta.is_installed = true;
            meta.is_deployed = true;
            meta.updated_at_ms = now_ms();
            if let Some(server) = doc.mcp_servers.get_mut(&id) {
                server.env_values = env_values;
            }
            Ok(())
        })
        .await
    }
}

fn load_document(backend: &dyn DocumentBackend) -> Result<ConfigDocument> {
    match backend.read()? {
        Some(text) if !text.trim().is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(ConfigDocument::default()),
    }
}

fn normalize_remote(mut metadata: PluginMetadata) -> Result<PluginMetadata> {
    let endpoint_ok = metadata
        .endpoint
        .as_deref()
        .is_some_and(|e| !e.trim().is_empty());
    if !endpoint_ok {
        return Err(StoreError::message("remote server requires an endpoint"));
    }
    metadata.plugin_type = mcpdock_common::PluginType::Remote;
    metadata.is_installed = true;
    metadata.is_deployed = false;
    metadata.connection_type = Some(metadata.connection_type.unwrap_or_default());
    Ok(metadata)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::backend::FileBackend,
        futures::StreamExt,
        mcpdock_common::{ConnectionType, EnvVarSpec},
    };

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    async fn memory_store() -> (ConfigStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ConfigStore::open(backend.clone()).await.unwrap();
        (store, backend)
    }

    const WEATHER: &str = r#"{"mcpServers":{"weather":{"command":"node","args":["server.js"]}}}"#;

    #[tokio::test]
    async fn test_merge_into_empty_store() {
        let (store, backend) = memory_store().await;
        let out = store.merge_from_json(WEATHER).await.unwrap();
        assert_eq!(out.count, 1);
        assert!(store.snapshot().configured_ids().contains(&id("weather")));
        assert!(backend.text().unwrap().contains("\"weather\""));
    }

    #[tokio::test]
    async fn test_merge_twice_same_snapshot_and_count() {
        let (store, _) = memory_store().await;
        let doc = r#"{"mcpServers":{"a":{"command":"x"},"b":{"command":"y"}}}"#;
        assert_eq!(store.merge_from_json(doc).await.unwrap().count, 2);
        let first = store.snapshot();
        assert_eq!(store.merge_from_json(doc).await.unwrap().count, 2);
        assert_eq!(*store.snapshot(), *first);
    }

    #[tokio::test]
    async fn test_failed_merge_leaves_store_untouched() {
        let (store, backend) = memory_store().await;
        store.merge_from_json(WEATHER).await.unwrap();
        let before_doc = store.snapshot();
        let before_text = backend.text();

        let err = store
            .merge_from_json(r#"{"mcpServers":{"weather":{"args":42}}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConfigParse { .. }));
        assert_eq!(*store.snapshot(), *before_doc);
        assert_eq!(backend.text(), before_text);
    }

    #[tokio::test]
    async fn test_commit_failure_publishes_nothing() {
        let (store, backend) = memory_store().await;
        backend.set_fail_commits(true);
        assert!(store.merge_from_json(WEATHER).await.is_err());
        assert!(store.snapshot().mcp_servers.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_enabled_restores_document() {
        let (store, backend) = memory_store().await;
        store.merge_from_json(WEATHER).await.unwrap();
        let weather = id("weather");
        let original = store.snapshot();
        let original_text = backend.text().unwrap();

        store.set_enabled(&weather, false).await.unwrap();
        assert!(!store.snapshot().is_enabled(&weather));
        assert_eq!(store.snapshot().mcp_servers, original.mcp_servers);
        assert_eq!(store.snapshot().plugin_metadata, original.plugin_metadata);

        store.set_enabled(&weather, true).await.unwrap();
        assert!(store.snapshot().is_enabled(&weather));
        assert_eq!(backend.text().unwrap(), original_text);
    }

    #[tokio::test]
    async fn test_set_enabled_is_idempotent() {
        let (store, _) = memory_store().await;
        store.set_enabled(&id("a"), false).await.unwrap();
        let once = store.snapshot();
        store.set_enabled(&id("a"), false).await.unwrap();
        assert_eq!(*store.snapshot(), *once);
    }

    #[tokio::test]
    async fn test_write_rereads_latest_committed_document() {
        let (store, backend) = memory_store().await;
        store.merge_from_json(WEATHER).await.unwrap();

        // Another writer commits behind our back.
        backend.replace_text(r#"{"mcpServers":{"other":{"command":"x"}}}"#);
        store.set_enabled(&id("other"), false).await.unwrap();

        let snap = store.snapshot();
        assert!(snap.mcp_servers.contains_key(&id("other")));
        assert!(!snap.mcp_servers.contains_key(&id("weather")));
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let (store, _) = memory_store().await;
        let store = Arc::new(store);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let doc = format!(r#"{{"mcpServers":{{"p{i}":{{"command":"run"}}}}}}"#);
                store.merge_from_json(&doc).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.snapshot().mcp_servers.len(), 16);
    }

    #[tokio::test]
    async fn test_subscribe_yields_committed_snapshots() {
        let (store, _) = memory_store().await;
        let mut stream = store.subscribe();
        store.merge_from_json(WEATHER).await.unwrap();
        let next = stream.next().await.unwrap();
        assert!(next.mcp_servers.contains_key(&id("weather")));
    }

    #[tokio::test]
    async fn test_plugin_config_roundtrip_and_validation() {
        let (store, _) = memory_store().await;
        let raw = "{ \"units\" : \"metric\" }";
        store.save_plugin_config(&id("w"), raw).await.unwrap();
        assert_eq!(store.plugin_config(&id("w")).unwrap(), raw);

        let err = store.save_plugin_config(&id("w"), "{oops").await.unwrap_err();
        assert!(matches!(err, StoreError::ConfigParse { .. }));
        assert_eq!(store.plugin_config(&id("w")).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_remote_server_lifecycle() {
        let (store, _) = memory_store().await;
        let docs = id("docs");
        let meta = PluginMetadata::remote("Docs", "https://d/mcp", ConnectionType::HttpStream, None);
        store.add_remote_server(&docs, meta.clone()).await.unwrap();

        let err = store.add_remote_server(&docs, meta).await.unwrap_err();
        assert!(matches!(err, StoreError::IdConflict { .. }));

        let created = store.snapshot().metadata(&docs).unwrap().created_at_ms;
        let edited = PluginMetadata::remote(
            "Docs v2",
            "https://d/v2/mcp",
            ConnectionType::Sse,
            Some("t".into()),
        );
        store.update_remote_server(&docs, edited).await.unwrap();
        let meta = store.snapshot().metadata(&docs).cloned().unwrap();
        assert_eq!(meta.name, "Docs v2");
        assert_eq!(meta.created_at_ms, created);
        assert_eq!(meta.connection_type, Some(ConnectionType::Sse));
    }

    #[tokio::test]
    async fn test_update_remote_rejects_local_and_missing() {
        let (store, _) = memory_store().await;
        store
            .upsert_metadata(&id("loc"), PluginMetadata::local("Loc"))
            .await
            .unwrap();
        let remote = PluginMetadata::remote("x", "http://x", ConnectionType::Sse, None);

        let err = store
            .update_remote_server(&id("loc"), remote.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotRemote { .. }));
        let err = store
            .update_remote_server(&id("nope"), remote)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_emits_event_only_when_present() {
        let (store, _) = memory_store().await;
        let mut events = store.events();
        store.merge_from_json(WEATHER).await.unwrap();

        assert!(!store.remove_plugin(&id("ghost")).await.unwrap());
        assert!(store.remove_plugin(&id("weather")).await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::PluginRemoved(id("weather"))
        );
        assert!(store.snapshot().known_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mark_deployed_records_env_values() {
        let (store, _) = memory_store().await;
        let w = id("w");
        let mut cfg = ServerConfig::new("node", vec!["index.js".into()]);
        cfg.env.push(EnvVarSpec::required("API_KEY"));
        store.set_server_config(&w, cfg).await.unwrap();

        store
            .mark_deployed(&w, BTreeMap::from([("API_KEY".into(), "k".into())]))
            .await
            .unwrap();
        let snap = store.snapshot();
        assert!(snap.metadata(&w).unwrap().is_deployed);
        assert_eq!(snap.server(&w).unwrap().env_values["API_KEY"], "k");
    }

    #[tokio::test]
    async fn test_register_discovered_skips_known() {
        let (store, _) = memory_store().await;
        store.merge_from_json(WEATHER).await.unwrap();
        let added = store
            .register_discovered(vec![
                (id("weather"), PluginMetadata::local("weather")),
                (id("disk_only"), PluginMetadata::local("disk_only")),
            ])
            .await
            .unwrap();
        assert_eq!(added, vec![id("disk_only")]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plugins.json");
        {
            let store = ConfigStore::open(Arc::new(FileBackend::new(&path)))
                .await
                .unwrap();
            store.merge_from_json(WEATHER).await.unwrap();
            store.set_enabled(&id("weather"), false).await.unwrap();
        }
        let store = ConfigStore::open(Arc::new(FileBackend::new(&path)))
            .await
            .unwrap();
        let snap = store.snapshot();
        assert!(snap.mcp_servers.contains_key(&id("weather")));
        assert!(!snap.is_enabled(&id("weather")));
    }
}
