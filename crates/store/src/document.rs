//! The persisted plugin document.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use {
    mcpdock_common::{PluginId, PluginMetadata, PluginTarget, ServerConfig},
    serde::{Deserialize, Serialize},
};

/// Whole-document state of the config store.
///
/// All maps share one id namespace. Maps are ordered so that serializing the
/// same logical content always produces the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub mcp_servers: BTreeMap<PluginId, ServerConfig>,
    #[serde(default)]
    pub plugin_metadata: BTreeMap<PluginId, PluginMetadata>,
    /// Only disabled plugins are recorded; absent means enabled.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enablement: BTreeMap<PluginId, bool>,
    /// Raw per-plugin config text, stored verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_configs: BTreeMap<PluginId, String>,
}

impl ConfigDocument {
    pub fn contains(&self, id: &PluginId) -> bool {
        self.mcp_servers.contains_key(id) || self.plugin_metadata.contains_key(id)
    }

    pub fn is_enabled(&self, id: &PluginId) -> bool {
        self.enablement.get(id).copied().unwrap_or(true)
    }

    pub fn server(&self, id: &PluginId) -> Option<&ServerConfig> {
        self.mcp_servers.get(id)
    }

    pub fn metadata(&self, id: &PluginId) -> Option<&PluginMetadata> {
        self.plugin_metadata.get(id)
    }

    pub fn is_remote(&self, id: &PluginId) -> bool {
        self.metadata(id).is_some_and(PluginMetadata::is_remote)
    }

    /// Ids declared with a launch config.
    pub fn configured_ids(&self) -> BTreeSet<PluginId> {
        self.mcp_servers.keys().cloned().collect()
    }

    /// Ids registered as remote endpoints.
    pub fn remote_ids(&self) -> BTreeSet<PluginId> {
        self.plugin_metadata
            .iter()
            .filter(|(_, meta)| meta.is_remote())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every id the document knows about.
    pub fn known_ids(&self) -> BTreeSet<PluginId> {
        self.mcp_servers
            .keys()
            .chain(self.plugin_metadata.keys())
            .cloned()
            .collect()
    }

    pub fn target(&self, id: &PluginId, plugins_dir: &Path) -> Option<PluginTarget> {
        PluginTarget::resolve(
            plugins_dir.join(id.as_str()),
            self.metadata(id),
            self.server(id),
        )
    }

    /// Drop every trace of `id`. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, id: &PluginId) -> bool {
        let a = self.mcp_servers.remove(id).is_some();
        let b = self.plugin_metadata.remove(id).is_some();
        let c = self.enablement.remove(id).is_some();
        let d = self.plugin_configs.remove(id).is_some();
        a || b || c || d
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
