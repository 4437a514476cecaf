//! Shared types, error definitions, and utilities used across all mcpdock crates.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{
        CapabilitySnapshot, ConnectionType, DeploymentState, EnvVarSpec, FailureReason,
        InstallProgress, InstallStage, InvalidPluginId, PluginId, PluginMetadata, PluginTarget,
        PluginType, RunningStatus, ServerConfig, now_ms,
    },
};
