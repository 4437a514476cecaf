//! Parsing and field-wise merging of externally supplied `mcpServers` documents.
//!
//! Accepts the shape this store persists as well as the common third-party
//! shape where `env` is a plain `{NAME: value}` object and remote servers are
//! declared with a `url`.

use std::collections::{BTreeMap, BTreeSet};

use {
    mcpdock_common::{
        ConnectionType, EnvVarSpec, PluginId, PluginMetadata, PluginType, ServerConfig,
    },
    serde::Deserialize,
};

use crate::{
    document::ConfigDocument,
    error::{Result, StoreError},
};

/// What a merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Number of distinct ids present in the input.
    pub count: usize,
    pub inserted: BTreeSet<PluginId>,
    pub updated: BTreeSet<PluginId>,
    /// Ids whose existing launch config changed.
    pub server_config_overwritten: BTreeSet<PluginId>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvPatch {
    Declared(Vec<EnvVarSpec>),
    Values(BTreeMap<String, String>),
}

impl EnvPatch {
    fn into_specs(self) -> Vec<EnvVarSpec> {
        match self {
            Self::Declared(specs) => specs,
            Self::Values(values) => values
                .into_iter()
                .map(|(name, value)| EnvVarSpec::optional(name, Some(value)))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPatch {
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<EnvPatch>,
    url: Option<String>,
    #[serde(rename = "type", alias = "transport")]
    transport: Option<String>,
    headers: Option<BTreeMap<String, String>>,
}

impl ServerPatch {
    fn bearer_token(&self) -> Option<String> {
        self.headers.as_ref()?.iter().find_map(|(name, value)| {
            name.eq_ignore_ascii_case("authorization")
                .then(|| value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPatch {
    name: Option<String>,
    description: Option<String>,
    author: Option<String>,
    version: Option<String>,
    #[serde(rename = "type")]
    plugin_type: Option<PluginType>,
    is_installed: Option<bool>,
    endpoint: Option<String>,
    connection_type: Option<ConnectionType>,
    bearer_token: Option<String>,
    repo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImport {
    mcp_servers: Option<BTreeMap<String, ServerPatch>>,
    plugin_metadata: Option<BTreeMap<String, MetadataPatch>>,
}

/// A validated import, ready to be applied to a document.
#[derive(Debug, Default)]
pub struct ImportDocument {
    servers: BTreeMap<PluginId, ServerPatch>,
    metadata: BTreeMap<PluginId, MetadataPatch>,
}

impl ImportDocument {
    /// Parse and validate without touching any store state.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| StoreError::config_parse(e.to_string()))?;
        if !value.is_object() {
            return Err(StoreError::config_parse("top level must be a JSON object"));
        }

        let raw: RawImport =
            serde_json::from_value(value).map_err(|e| StoreError::config_parse(e.to_string()))?;
        if raw.mcp_servers.is_none() && raw.plugin_metadata.is_none() {
            return Err(StoreError::config_parse(
                "expected an `mcpServers` or `pluginMetadata` object",
            ));
        }

        let mut doc = Self::default();
        for (raw_id, patch) in raw.mcp_servers.unwrap_or_default() {
            let id = PluginId::new(&raw_id).map_err(|e| StoreError::config_parse(e.to_string()))?;
            doc.servers.insert(id, patch);
        }
        for (raw_id, patch) in raw.plugin_metadata.unwrap_or_default() {
            let id = PluginId::new(&raw_id).map_err(|e| StoreError::config_parse(e.to_string()))?;
            doc.metadata.insert(id, patch);
        }
        Ok(doc)
    }

    pub fn ids(&self) -> BTreeSet<PluginId> {
        self.servers
            .keys()
            .chain(self.metadata.keys())
            .cloned()
            .collect()
    }

    /// Apply supplied fields onto `doc`. New values win, omitted fields are kept.
    pub fn apply(self, doc: &mut ConfigDocument, now_ms: u64) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            count: self.ids().len(),
            ..Default::default()
        };
        for id in self.ids() {
            if doc.contains(&id) {
                outcome.updated.insert(id);
            } else {
                outcome.inserted.insert(id);
            }
        }

        for (id, patch) in self.servers {
            if let Some(url) = patch.url.clone() {
                let connection_type = patch
                    .transport
                    .as_deref()
                    .map(ConnectionType::from_transport_name)
                    .unwrap_or_default();
                let remote = MetadataPatch {
                    plugin_type: Some(PluginType::Remote),
                    is_installed: Some(true),
                    endpoint: Some(url),
                    connection_type: Some(connection_type),
                    bearer_token: patch.bearer_token(),
                    ..Default::default()
                };
                apply_metadata(doc, &id, remote, now_ms);
                // A remote plugin has no launch config of its own.
                if doc.mcp_servers.remove(&id).is_some() {
                    outcome.server_config_overwritten.insert(id);
                }
                continue;
            }

            let before = doc.mcp_servers.get(&id).cloned();
            let server = doc.mcp_servers.entry(id.clone()).or_default();
            if let Some(command) = patch.command {
                server.command = command;
            }
            if let Some(args) = patch.args {
                server.args = args;
            }
            if let Some(env) = patch.env {
                server.env = env.into_specs();
            }
            if before.as_ref().is_some_and(|b| b != server) {
                outcome.server_config_overwritten.insert(id);
            }
        }

        for (id, patch) in self.metadata {
            apply_metadata(doc, &id, patch, now_ms);
        }

        outcome
    }
}

fn apply_metadata(doc: &mut ConfigDocument, id: &PluginId, patch: MetadataPatch, now_ms: u64) {
    let existing = doc.plugin_metadata.get(id).cloned();
    let mut meta = existing.clone().unwrap_or_else(|| PluginMetadata {
        name: id.to_string(),
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
        ..Default::default()
    });

    if let Some(v) = patch.name {
        meta.name = v;
    }
    if let Some(v) = patch.description {
        meta.description = v;
    }
    if let Some(v) = patch.author {
        meta.author = v;
    }
    if let Some(v) = patch.version {
        meta.version = v;
    }
    if let Some(v) = patch.plugin_type {
        meta.plugin_type = v;
    }
    if let Some(v) = patch.is_installed {
        meta.is_installed = v;
    }
    if patch.endpoint.is_some() {
        meta.endpoint = patch.endpoint;
    }
    if patch.connection_type.is_some() {
        meta.connection_type = patch.connection_type;
    }
    if patch.bearer_token.is_some() {
        meta.bearer_token = patch.bearer_token;
    }
    if patch.repo_url.is_some() {
        meta.repo_url = patch.repo_url;
    }
    if meta.is_remote() {
        meta.is_installed = true;
    }

    match existing {
        Some(old) if old == meta => {},
        Some(_) => {
            meta.updated_at_ms = now_ms;
            doc.plugin_metadata.insert(id.clone(), meta);
        },
        None => {
            doc.plugin_metadata.insert(id.clone(), meta);
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    fn merge(doc: &mut ConfigDocument, text: &str, now: u64) -> MergeOutcome {
        ImportDocument::parse(text).unwrap().apply(doc, now)
    }

    #[test]
    fn test_rejects_bad_shapes() {
        for bad in [
            "not json",
            "[]",
            "{}",
            r#"{"mcpServers": []}"#,
            r#"{"mcpServers": {"x": {"args": "not-a-list"}}}"#,
            r#"{"mcpServers": {"!!!": {"command": "node"}}}"#,
        ] {
            let err = ImportDocument::parse(bad).unwrap_err();
            assert!(matches!(err, StoreError::ConfigParse { .. }), "input {bad}");
        }
    }

    #[test]
    fn test_insert_into_empty_document() {
        let mut doc = ConfigDocument::default();
        let out = merge(
            &mut doc,
            r#"{"mcpServers":{"weather":{"command":"node","args":["server.js"]}}}"#,
            1,
        );
        assert_eq!(out.count, 1);
        assert_eq!(out.inserted, BTreeSet::from([id("weather")]));
        let server = doc.server(&id("weather")).unwrap();
        assert_eq!(server.command, "node");
        assert_eq!(server.args, vec!["server.js"]);
    }

    #[test]
    fn test_omitted_fields_are_retained() {
        let mut doc = ConfigDocument::default();
        merge(
            &mut doc,
            r#"{"mcpServers":{"w":{"command":"node","args":["a.js"],"env":[{"name":"K","required":true}]}}}"#,
            1,
        );
        let out = merge(&mut doc, r#"{"mcpServers":{"w":{"args":["b.js"]}}}"#, 2);

        let server = doc.server(&id("w")).unwrap();
        assert_eq!(server.command, "node");
        assert_eq!(server.args, vec!["b.js"]);
        assert_eq!(server.env.len(), 1);
        assert_eq!(out.server_config_overwritten, BTreeSet::from([id("w")]));
    }

    #[test]
    fn test_merge_twice_is_idempotent() {
        let text = r#"{
            "mcpServers": {"a": {"command": "uvx", "args": ["mcp-a"]}},
            "pluginMetadata": {"a": {"name": "A", "author": "me", "version": "1.0.0"}}
        }"#;
        let mut doc = ConfigDocument::default();
        let first = merge(&mut doc, text, 10);
        let after_first = doc.clone();
        let second = merge(&mut doc, text, 20);

        assert_eq!(doc, after_first);
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 1);
        assert!(second.server_config_overwritten.is_empty());
        assert_eq!(second.updated, BTreeSet::from([id("a")]));
    }

    #[test]
    fn test_env_value_map_becomes_defaults() {
        let mut doc = ConfigDocument::default();
        merge(
            &mut doc,
            r#"{"mcpServers":{"gh":{"command":"npx","env":{"GITHUB_TOKEN":"abc"}}}}"#,
            1,
        );
        let spec = doc.server(&id("gh")).unwrap().env_spec("GITHUB_TOKEN").unwrap();
        assert!(!spec.required);
        assert_eq!(spec.default.as_deref(), Some("abc"));
    }

    #[test]
    fn test_url_entry_registers_remote() {
        let mut doc = ConfigDocument::default();
        merge(
            &mut doc,
            r#"{"mcpServers":{"docs":{"url":"https://docs.example/sse","type":"sse","headers":{"Authorization":"Bearer tok"}}}}"#,
            1,
        );
        assert!(doc.server(&id("docs")).is_none());
        let meta = doc.metadata(&id("docs")).unwrap();
        assert!(meta.is_remote());
        assert!(meta.is_installed);
        assert_eq!(meta.connection_type, Some(ConnectionType::Sse));
        assert_eq!(meta.bearer_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_url_entry_replaces_local_launch_config() {
        let mut doc = ConfigDocument::default();
        merge(&mut doc, r#"{"mcpServers":{"docs":{"command":"node","args":["a.js"]}}}"#, 1);
        assert!(doc.server(&id("docs")).is_some());

        let out = merge(&mut doc, r#"{"mcpServers":{"docs":{"url":"https://docs.example/mcp"}}}"#, 2);
        assert!(doc.server(&id("docs")).is_none());
        assert!(doc.metadata(&id("docs")).unwrap().is_remote());
        assert!(out.updated.contains(&id("docs")));
        assert!(out.server_config_overwritten.contains(&id("docs")));
    }

    #[test]
    fn test_count_uses_union_of_both_maps() {
        let mut doc = ConfigDocument::default();
        let out = merge(
            &mut doc,
            r#"{"mcpServers":{"a":{"command":"x"}},"pluginMetadata":{"a":{"name":"A"},"b":{"name":"B"}}}"#,
            1,
        );
        assert_eq!(out.count, 2);
    }
}
