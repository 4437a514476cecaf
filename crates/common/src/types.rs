//! Plugin model shared by the store, installer, deployer, bridge, and hub.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── PluginId ────────────────────────────────────────────────────────────────

/// Returned when a raw name sanitizes to nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{raw}' does not contain any characters usable in a plugin id")]
pub struct InvalidPluginId {
    pub raw: String,
}

/// Stable plugin key made of lowercase ASCII alphanumerics and single underscores.
///
/// Every constructor sanitizes, and sanitizing is idempotent, so the same logical
/// plugin always maps to the same id no matter how often it is re-imported.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginId(String);

impl PluginId {
    pub fn new(raw: &str) -> Result<Self, InvalidPluginId> {
        let sanitized = Self::sanitize(raw);
        if sanitized.is_empty() {
            return Err(InvalidPluginId {
                raw: raw.to_string(),
            });
        }
        Ok(Self(sanitized))
    }

    /// Map a free-form name onto the id alphabet.
    pub fn sanitize(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut last_was_sep = true;
        for ch in raw.trim().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PluginId {
    type Error = InvalidPluginId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PluginId> for String {
    fn from(id: PluginId) -> Self {
        id.0
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── Launch configuration ────────────────────────────────────────────────────

/// One declared environment variable of a local plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl EnvVarSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, default: Option<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default,
            description: String::new(),
        }
    }
}

/// Launch descriptor for a local plugin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    /// Values resolved at the last successful deploy, reused to relaunch the service.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_values: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Default::default()
        }
    }

    pub fn env_spec(&self, name: &str) -> Option<&EnvVarSpec> {
        self.env.iter().find(|spec| spec.name == name)
    }
}

// ── Metadata ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Wire style used to reach a remote plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    /// Streamable HTTP: JSON-RPC over POST, JSON or event-stream replies.
    #[default]
    HttpStream,
    /// Legacy SSE: long-lived GET stream plus a POST endpoint it announces.
    Sse,
}

impl ConnectionType {
    /// Interpret the transport names found in third-party `mcpServers` documents.
    pub fn from_transport_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sse" => Self::Sse,
            _ => Self::HttpStream,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStream => f.write_str("httpStream"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

/// Descriptive record of a plugin.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub is_installed: bool,
    #[serde(default)]
    pub is_deployed: bool,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
}

impl PluginMetadata {
    pub fn local(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            plugin_type: PluginType::Local,
            created_at_ms: now,
            updated_at_ms: now,
            ..Default::default()
        }
    }

    /// Remote plugins have nothing to install, so they are born installed.
    pub fn remote(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        connection_type: ConnectionType,
        bearer_token: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            plugin_type: PluginType::Remote,
            is_installed: true,
            created_at_ms: now,
            updated_at_ms: now,
            endpoint: Some(endpoint.into()),
            connection_type: Some(connection_type),
            bearer_token,
            ..Default::default()
        }
    }

    pub fn is_remote(&self) -> bool {
        self.plugin_type == PluginType::Remote
    }

    pub fn display_name<'a>(&'a self, id: &'a PluginId) -> &'a str {
        if self.name.trim().is_empty() {
            id.as_str()
        } else {
            &self.name
        }
    }
}

impl fmt::Debug for PluginMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginMetadata")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("plugin_type", &self.plugin_type)
            .field("is_installed", &self.is_installed)
            .field("is_deployed", &self.is_deployed)
            .field("endpoint", &self.endpoint)
            .field("connection_type", &self.connection_type)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .field("repo_url", &self.repo_url)
            .finish_non_exhaustive()
    }
}

// ── Targets ─────────────────────────────────────────────────────────────────

/// Where and how a plugin is reached.
#[derive(Clone, PartialEq, Eq)]
pub enum PluginTarget {
    Local {
        sandbox_path: PathBuf,
        command: ServerConfig,
    },
    Remote {
        endpoint: String,
        connection_type: ConnectionType,
        token: Option<String>,
    },
}

impl PluginTarget {
    /// Build the target for a plugin from its document entries.
    ///
    /// Returns `None` for a remote plugin without an endpoint, or a local plugin
    /// that has no launch command yet.
    pub fn resolve(
        sandbox_path: PathBuf,
        metadata: Option<&PluginMetadata>,
        server: Option<&ServerConfig>,
    ) -> Option<Self> {
        match metadata.map(|m| m.plugin_type) {
            Some(PluginType::Remote) => {
                let meta = metadata?;
                Some(Self::Remote {
                    endpoint: meta.endpoint.clone()?,
                    connection_type: meta.connection_type.unwrap_or_default(),
                    token: meta.bearer_token.clone(),
                })
            },
            Some(PluginType::Local) | None => {
                let server = server.filter(|s| !s.command.trim().is_empty())?;
                Some(Self::Local {
                    sandbox_path,
                    command: server.clone(),
                })
            },
        }
    }
}

impl fmt::Debug for PluginTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local {
                sandbox_path,
                command,
            } => f
                .debug_struct("Local")
                .field("sandbox_path", sandbox_path)
                .field("command", &command.command)
                .field("args", &command.args)
                .finish(),
            Self::Remote {
                endpoint,
                connection_type,
                token,
            } => f
                .debug_struct("Remote")
                .field("endpoint", endpoint)
                .field("connection_type", connection_type)
                .field("token", &token.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

// ── Transient state ─────────────────────────────────────────────────────────

/// Why a deployment attempt ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    MissingManifest,
    MissingRequiredEnv { names: Vec<String> },
    CommandFailed { command: String, exit_code: i32 },
    Cancelled,
    Spawn { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingManifest => f.write_str("no plugin manifest found"),
            Self::MissingRequiredEnv { names } => {
                write!(f, "missing required env: {}", names.join(", "))
            },
            Self::CommandFailed { command, exit_code } => {
                write!(f, "`{command}` exited with code {exit_code}")
            },
            Self::Cancelled => f.write_str("cancelled"),
            Self::Spawn { message } => write!(f, "failed to run command: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeploymentState {
    #[default]
    NotDeployed,
    GeneratingCommands,
    AwaitingConfirmation,
    Deploying,
    Success,
    Failed {
        reason: FailureReason,
    },
}

impl DeploymentState {
    pub fn failed(reason: FailureReason) -> Self {
        Self::Failed { reason }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed { .. })
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Deploying)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningStatus {
    pub active: bool,
    pub last_checked_ms: u64,
}

/// Ordered install stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallStage {
    Resolving,
    Downloading,
    Extracting,
    Validating,
    Registering,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstallProgress {
    pub stage: InstallStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl InstallProgress {
    pub fn stage(stage: InstallStage) -> Self {
        Self {
            stage,
            percent: None,
        }
    }

    pub fn downloading(percent: Option<u8>) -> Self {
        Self {
            stage: InstallStage::Downloading,
            percent: percent.map(|p| p.min(100)),
        }
    }
}

/// Last-known tool names per plugin.
pub type CapabilitySnapshot = BTreeMap<PluginId, Vec<String>>;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_maps_to_id_alphabet() {
        assert_eq!(PluginId::sanitize("Weather Server!"), "weather_server");
        assert_eq!(PluginId::sanitize("  --github.mcp--  "), "github_mcp");
        assert_eq!(PluginId::sanitize("a__b"), "a_b");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in ["@scope/pkg-name", "Ünïcode name", "x", "__lead", "mixed_CASE-99"] {
            let once = PluginId::sanitize(raw);
            assert_eq!(PluginId::sanitize(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn test_plugin_id_rejects_empty() {
        assert!(PluginId::new("!!!").is_err());
        assert!(PluginId::new("").is_err());
    }

    #[test]
    fn test_plugin_id_deserializes_through_sanitizer() {
        let id: PluginId = serde_json::from_str("\"My Plugin\"").unwrap();
        assert_eq!(id.as_str(), "my_plugin");
    }

    #[test]
    fn test_metadata_wire_names() {
        let meta = PluginMetadata::remote(
            "Docs",
            "https://example.com/mcp",
            ConnectionType::Sse,
            Some("secret".into()),
        );
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "remote");
        assert_eq!(json["isInstalled"], true);
        assert_eq!(json["connectionType"], "sse");
        assert_eq!(json["bearerToken"], "secret");
    }

    #[test]
    fn test_metadata_debug_redacts_token() {
        let meta = PluginMetadata::remote(
            "Docs",
            "https://example.com/mcp",
            ConnectionType::HttpStream,
            Some("hunter2".into()),
        );
        let debug = format!("{meta:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_server_config_omits_empty_env_values() {
        let cfg = ServerConfig::new("node", vec!["server.js".into()]);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("envValues"));
    }

    #[test]
    fn test_target_resolution() {
        let remote = PluginMetadata::remote("r", "http://h/mcp", ConnectionType::Sse, None);
        let target = PluginTarget::resolve(PathBuf::from("/x"), Some(&remote), None).unwrap();
        assert!(matches!(target, PluginTarget::Remote { connection_type: ConnectionType::Sse, .. }));

        let local = PluginMetadata::local("l");
        assert!(PluginTarget::resolve(PathBuf::from("/x"), Some(&local), None).is_none());

        let server = ServerConfig::new("node", vec!["index.js".into()]);
        let target =
            PluginTarget::resolve(PathBuf::from("/x"), Some(&local), Some(&server)).unwrap();
        assert!(matches!(target, PluginTarget::Local { .. }));
    }

    #[test]
    fn test_install_stages_are_ordered() {
        assert!(InstallStage::Resolving < InstallStage::Downloading);
        assert!(InstallStage::Validating < InstallStage::Done);
        assert_eq!(InstallProgress::downloading(Some(250)).percent, Some(100));
    }
}
