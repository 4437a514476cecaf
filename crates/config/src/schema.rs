//! Settings schema.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Overrides the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub bridge: BridgeSettings,
    pub install: InstallSettings,
    pub deploy: DeploySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Upper bound for one capability query, in seconds.
    pub timeout_secs: u64,
    /// How long a plugin that timed out is skipped by background refreshes.
    pub refresh_backoff_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            refresh_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub github_api_url: String,
    pub user_agent: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            github_api_url: "https://api.github.com".into(),
            user_agent: concat!("mcpdock/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Shell used to run deploy commands (`<shell> -c <command>`).
    pub shell: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}
