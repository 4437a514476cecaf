use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::HubConfig};

/// Standard settings file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "mcpdock.toml",
    "mcpdock.yaml",
    "mcpdock.yml",
    "mcpdock.json",
];

const DATA_DIR_ENV: &str = "MCPDOCK_DATA_DIR";
const STORE_FILENAME: &str = "plugins.json";
const PLUGINS_DIRNAME: &str = "plugins";

/// Load settings from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<HubConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load settings.
///
/// Search order:
/// 1. `explicit_dir/mcpdock.{toml,yaml,yml,json}` when a directory is given
/// 2. `./mcpdock.{toml,yaml,yml,json}`
/// 3. `~/.config/mcpdock/mcpdock.{toml,yaml,yml,json}`
///
/// Falls back to [`HubConfig::default`] when nothing is found or parsing fails.
pub fn discover_and_load(explicit_dir: Option<&Path>) -> HubConfig {
    let Some(path) = find_config_file(explicit_dir) else {
        debug!("no settings file found, using defaults");
        return HubConfig::default();
    };

    debug!(path = %path.display(), "loading settings");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load settings, using defaults");
            HubConfig::default()
        },
    }
}

fn find_config_file(explicit_dir: Option<&Path>) -> Option<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = explicit_dir {
        dirs.push(dir.to_path_buf());
    }
    dirs.push(PathBuf::from("."));
    if let Some(dir) = config_dir() {
        dirs.push(dir);
    }

    dirs.iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.is_file())
}

/// User-global settings directory (`~/.config/mcpdock/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mcpdock").map(|d| d.config_dir().to_path_buf())
}

/// Resolve the data directory: settings value, then `MCPDOCK_DATA_DIR`, then the
/// platform default, then `./.mcpdock`.
pub fn data_dir(config: &HubConfig) -> PathBuf {
    if let Some(dir) = &config.data_dir {
        return dir.clone();
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("", "", "mcpdock")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mcpdock"))
}

/// Location of the persisted plugin document.
pub fn store_path(config: &HubConfig) -> PathBuf {
    data_dir(config).join(STORE_FILENAME)
}

/// Root holding one sandbox directory per installed plugin.
pub fn plugins_dir(config: &HubConfig) -> PathBuf {
    data_dir(config).join(PLUGINS_DIRNAME)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<HubConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported settings format: .{ext}"),
    }
}
