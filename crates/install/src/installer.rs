use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    mcpdock_common::{
        InstallProgress, InstallStage, PluginId, PluginMetadata, PluginType, now_ms,
    },
    mcpdock_config::InstallSettings,
    mcpdock_store::{ConfigStore, StoreEvent},
    tokio::{sync::broadcast, task::JoinHandle},
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    archive,
    error::{InstallError, Result},
    manifest::{DetectedManifest, detect_manifest},
};

const PROGRESS_CAPACITY: usize = 256;

/// Installs, registers, and removes plugin sandboxes under one root directory.
pub struct Installer {
    store: Arc<ConfigStore>,
    plugins_dir: PathBuf,
    http: reqwest::Client,
    settings: InstallSettings,
    progress: broadcast::Sender<(PluginId, InstallProgress)>,
}

impl Installer {
    pub fn new(store: Arc<ConfigStore>, plugins_dir: PathBuf, settings: &InstallSettings) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            store,
            plugins_dir,
            http: reqwest::Client::new(),
            settings: settings.clone(),
            progress,
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn sandbox_path(&self, id: &PluginId) -> PathBuf {
        self.plugins_dir.join(id.as_str())
    }

    /// Install progress for every plugin, tagged with its id.
    pub fn progress(&self) -> broadcast::Receiver<(PluginId, InstallProgress)> {
        self.progress.subscribe()
    }

    fn emit(&self, id: &PluginId, progress: InstallProgress) {
        let _ = self.progress.send((id.clone(), progress));
    }

    fn ensure_free(&self, id: &PluginId) -> Result<()> {
        if self.sandbox_path(id).exists() || self.store.snapshot().contains(id) {
            return Err(InstallError::IdConflict { id: id.clone() });
        }
        Ok(())
    }

    /// Download a GitHub repository tarball and install it as a local plugin.
    ///
    /// `source` is `owner/repo` or a GitHub URL. The id defaults to the repo name.
    pub async fn install_from_repo(&self, source: &str, id: Option<PluginId>) -> Result<PluginId> {
        let (owner, repo) = parse_source(source)?;
        let id = match id {
            Some(id) => id,
            None => PluginId::new(&repo)?,
        };
        self.emit(&id, InstallProgress::stage(InstallStage::Resolving));

        let result = self.install_repo_inner(&owner, &repo, &id).await;
        self.finish(&id, result).await
    }

    async fn install_repo_inner(&self, owner: &str, repo: &str, id: &PluginId) -> Result<()> {
        self.ensure_free(id)?;

        let bytes = self.download_tarball(owner, repo, id).await?;
        self.emit(id, InstallProgress::stage(InstallStage::Extracting));

        let staging = self.staging_path(id);
        let dest = staging.clone();
        let unpacked = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            archive::extract_tarball(&bytes, &dest)?;
            archive::content_root(&dest)
        })
        .await
        .map_err(|e| InstallError::external("extract task failed", e))
        .and_then(|r| r);

        let root = match unpacked {
            Ok(root) => root,
            Err(e) => {
                remove_dir_quietly(&staging).await;
                return Err(e);
            },
        };

        let manifest = self.promote(id, &staging, root).await?;

        let mut meta = PluginMetadata::local(repo);
        meta.repo_url = Some(format!("https://github.com/{owner}/{repo}"));
        self.register(id, meta, &manifest).await
    }

    /// Install a local plugin from a zip archive. The id is derived from
    /// `metadata.name`.
    pub async fn install_from_zip(
        &self,
        metadata: PluginMetadata,
        archive_path: &Path,
    ) -> Result<PluginId> {
        let id = PluginId::new(&metadata.name)?;
        self.emit(&id, InstallProgress::stage(InstallStage::Resolving));

        let result = self.install_zip_inner(&id, metadata, archive_path).await;
        self.finish(&id, result).await
    }

    async fn install_zip_inner(
        &self,
        id: &PluginId,
        metadata: PluginMetadata,
        archive_path: &Path,
    ) -> Result<()> {
        self.ensure_free(id)?;
        self.emit(id, InstallProgress::stage(InstallStage::Extracting));

        let staging = self.staging_path(id);
        let dest = staging.clone();
        let archive_path = archive_path.to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            archive::extract_zip(&archive_path, &dest)?;
            archive::content_root(&dest)
        })
        .await
        .map_err(|e| InstallError::external("extract task failed", e))
        .and_then(|r| r);

        let root = match unpacked {
            Ok(root) => root,
            Err(e) => {
                remove_dir_quietly(&staging).await;
                return Err(e);
            },
        };

        let manifest = self.promote(id, &staging, root).await?;
        self.register(id, metadata, &manifest).await
    }

    /// Register a remote endpoint. Touches neither the filesystem nor the network.
    pub async fn connect_remote(&self, metadata: PluginMetadata) -> Result<PluginId> {
        let id = PluginId::new(&metadata.name)?;
        self.store.add_remote_server(&id, metadata).await?;
        info!(plugin = %id, "connected remote plugin");
        Ok(id)
    }

    /// Remove the sandbox and every store entry of `id`. Unknown ids are a no-op.
    pub async fn uninstall(&self, id: &PluginId) -> Result<bool> {
        let sandbox = self.sandbox_path(id);
        let had_sandbox = sandbox.exists();
        if had_sandbox {
            tokio::fs::remove_dir_all(&sandbox).await?;
        }
        let had_entries = self.store.remove_plugin(id).await?;
        if had_sandbox || had_entries {
            info!(plugin = %id, had_sandbox, had_entries, "uninstalled plugin");
        }
        Ok(had_sandbox || had_entries)
    }

    /// Ids of every valid sandbox on disk, whether or not the store knows them.
    pub async fn discover_installed(&self) -> Result<BTreeSet<PluginId>> {
        let root = self.plugins_dir.clone();
        tokio::task::spawn_blocking(move || scan_sandboxes(&root))
            .await
            .map_err(|e| InstallError::external("discovery task failed", e))?
    }

    /// Valid sandboxes the store has no entry for.
    pub async fn discover_unregistered(&self) -> Result<BTreeSet<PluginId>> {
        let known = self.store.snapshot().known_ids();
        let found = self.discover_installed().await?;
        Ok(found.difference(&known).cloned().collect())
    }

    /// Create metadata for sandboxes found on disk that the store does not know.
    pub async fn register_unregistered(&self) -> Result<Vec<PluginId>> {
        let ids = self.discover_unregistered().await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let root = self.plugins_dir.clone();
        let found = tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .filter_map(|id| {
                    let manifest = detect_manifest(&root.join(id.as_str())).ok()??;
                    let mut meta = PluginMetadata::local("");
                    meta.is_installed = true;
                    manifest.fill_metadata(&mut meta);
                    if meta.name.is_empty() {
                        meta.name = id.to_string();
                    }
                    Some((id, meta))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| InstallError::external("discovery task failed", e))?;

        let added = self.store.register_discovered(found).await?;
        if !added.is_empty() {
            info!(count = added.len(), "registered plugins found on disk");
        }
        Ok(added)
    }

    /// Delete sandboxes whose plugin was removed from the store by any path.
    pub fn spawn_cleanup_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = self.store.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::PluginRemoved(id)) => {
                        let sandbox = this.sandbox_path(&id);
                        if sandbox.exists() {
                            match tokio::fs::remove_dir_all(&sandbox).await {
                                Ok(()) => info!(plugin = %id, "removed orphaned sandbox"),
                                Err(e) => warn!(plugin = %id, error = %e, "failed to remove sandbox"),
                            }
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "cleanup listener lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn staging_path(&self, id: &PluginId) -> PathBuf {
        self.plugins_dir
            .join(format!(".staging-{id}-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn download_tarball(&self, owner: &str, repo: &str, id: &PluginId) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{owner}/{repo}/tarball",
            self.settings.github_api_url.trim_end_matches('/')
        );
        debug!(%url, "downloading repository tarball");

        let mut resp = self
            .http
            .get(&url)
            .header("User-Agent", &self.settings.user_agent)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(InstallError::network(format!(
                "failed to fetch {owner}/{repo}: HTTP {}",
                resp.status()
            )));
        }

        let total = resp.content_length();
        let mut bytes = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut last_percent = None;
        self.emit(id, InstallProgress::downloading(total.map(|_| 0)));
        while let Some(chunk) = resp.chunk().await? {
            bytes.extend_from_slice(&chunk);
            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = ((bytes.len() as u64 * 100) / total).min(100) as u8;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    self.emit(id, InstallProgress::downloading(Some(percent)));
                }
            }
        }
        if total.is_none() {
            self.emit(id, InstallProgress::downloading(Some(100)));
        }
        Ok(bytes)
    }

    /// Validate the unpacked tree and rename it into its final place.
    async fn promote(
        &self,
        id: &PluginId,
        staging: &Path,
        root: PathBuf,
    ) -> Result<DetectedManifest> {
        self.emit(id, InstallProgress::stage(InstallStage::Validating));
        let sandbox = self.sandbox_path(id);
        let conflict_id = id.clone();

        let staging_owned = staging.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> Result<DetectedManifest> {
            let manifest = detect_manifest(&root)?.ok_or_else(|| {
                InstallError::archive("no plugin manifest found in archive")
            })?;
            if sandbox.exists() {
                return Err(InstallError::IdConflict { id: conflict_id });
            }
            std::fs::rename(&root, &sandbox)?;
            let mut manifest = manifest;
            if let Ok(rel) = manifest.path.strip_prefix(&root) {
                manifest.path = sandbox.join(rel);
            }
            if staging_owned.exists() {
                std::fs::remove_dir_all(&staging_owned)?;
            }
            Ok(manifest)
        })
        .await
        .map_err(|e| InstallError::external("validate task failed", e))
        .and_then(|r| r);

        if result.is_err() {
            remove_dir_quietly(staging).await;
        }
        result
    }

    async fn register(
        &self,
        id: &PluginId,
        mut meta: PluginMetadata,
        manifest: &DetectedManifest,
    ) -> Result<()> {
        self.emit(id, InstallProgress::stage(InstallStage::Registering));
        let now = now_ms();
        meta.plugin_type = PluginType::Local;
        meta.is_installed = true;
        meta.is_deployed = false;
        meta.created_at_ms = now;
        meta.updated_at_ms = now;
        manifest.fill_metadata(&mut meta);

        if !self.store.insert_metadata_if_absent(id, meta).await? {
            remove_dir_quietly(&self.sandbox_path(id)).await;
            return Err(InstallError::IdConflict { id: id.clone() });
        }
        info!(plugin = %id, manifest = %manifest.kind(), "installed plugin");
        Ok(())
    }

    async fn finish(&self, id: &PluginId, result: Result<()>) -> Result<PluginId> {
        match result {
            Ok(()) => {
                self.emit(id, InstallProgress::stage(InstallStage::Done));
                Ok(id.clone())
            },
            Err(e) => {
                warn!(plugin = %id, error = %e, "install failed");
                self.emit(id, InstallProgress::stage(InstallStage::Failed));
                Err(e)
            },
        }
    }
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to clean up directory");
    }
}

fn scan_sandboxes(root: &Path) -> Result<BTreeSet<PluginId>> {
    let mut found = BTreeSet::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || PluginId::sanitize(&name) != name {
            continue;
        }
        match detect_manifest(&entry.path()) {
            Ok(Some(_)) => {
                if let Ok(id) = PluginId::new(&name) {
                    found.insert(id);
                }
            },
            Ok(None) => debug!(dir = %name, "skipping sandbox without manifest"),
            Err(e) => debug!(dir = %name, error = %e, "skipping sandbox with bad manifest"),
        }
    }
    Ok(found)
}

/// Parse `owner/repo` from a source string.
/// Accepts `owner/repo`, `github.com/owner/repo`, or a GitHub URL, with an
/// optional trailing slash or `.git`.
pub fn parse_source(source: &str) -> Result<(String, String)> {
    let invalid = || InstallError::InvalidSource {
        input: source.to_string(),
    };
    let s = source.trim().trim_end_matches('/');
    let path = if s.starts_with("https://") || s.starts_with("http://") {
        let url = Url::parse(s).map_err(|_| invalid())?;
        if !matches!(url.host_str(), Some("github.com" | "www.github.com")) {
            return Err(invalid());
        }
        url.path().trim_matches('/').to_string()
    } else {
        s.strip_prefix("github.com/").unwrap_or(s).to_string()
    };
    let path = path.trim_end_matches(".git");

    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        },
        _ => Err(invalid()),
    }
}
