//! Settings loading, directory resolution, and env substitution.
//!
//! Settings files: `mcpdock.toml`, `mcpdock.yaml`, or `mcpdock.json`,
//! searched in an explicit directory, then `./`, then `~/.config/mcpdock/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in all values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config, plugins_dir, store_path},
    schema::{BridgeSettings, DeploySettings, HubConfig, InstallSettings},
};
