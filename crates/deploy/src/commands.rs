//! Turning a detected manifest into deploy commands and a launch config.

use std::path::Path;

use {
    async_trait::async_trait,
    mcpdock_common::ServerConfig,
    mcpdock_install::{DetectedManifest, ManifestDetails},
};

/// Commands to run in the sandbox, plus how to launch the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployPlan {
    pub commands: Vec<String>,
    /// Proposed launch config, persisted when the plugin has none yet.
    pub launch: Option<ServerConfig>,
}

#[async_trait]
pub trait CommandGenerator: Send + Sync {
    async fn generate(&self, sandbox: &Path, manifest: &DetectedManifest) -> DeployPlan;
}

/// Derives commands from the manifest: the explicit `deploy` list of
/// `mcp-plugin.json`, otherwise the usual build steps of the ecosystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestCommandGenerator;

#[async_trait]
impl CommandGenerator for ManifestCommandGenerator {
    async fn generate(&self, sandbox: &Path, manifest: &DetectedManifest) -> DeployPlan {
        match &manifest.details {
            ManifestDetails::Descriptor(d) => DeployPlan {
                commands: d.deploy.clone(),
                launch: d.command.as_ref().map(|command| ServerConfig {
                    command: command.clone(),
                    args: d.args.clone(),
                    env: d.env.clone(),
                    ..Default::default()
                }),
            },
            ManifestDetails::Node {
                main,
                build_script,
                start_script,
            } => {
                let mut commands = vec![if sandbox.join("package-lock.json").is_file() {
                    "npm ci".to_string()
                } else {
                    "npm install".to_string()
                }];
                if *build_script {
                    commands.push("npm run build".into());
                }
                let launch = match main {
                    Some(main) => ServerConfig::new("node", vec![main.clone()]),
                    None if *start_script => ServerConfig::new("npm", vec!["start".into()]),
                    None => ServerConfig::new("node", vec!["index.js".into()]),
                };
                DeployPlan {
                    commands,
                    launch: Some(launch),
                }
            },
            ManifestDetails::Python { pyproject, package } => {
                let install = if *pyproject {
                    ".venv/bin/pip install ."
                } else {
                    ".venv/bin/pip install -r requirements.txt"
                };
                let launch = match package {
                    Some(pkg) => ServerConfig::new(".venv/bin/python", vec![
                        "-m".into(),
                        pkg.replace('-', "_"),
                    ]),
                    None => {
                        let script = ["server.py", "main.py"]
                            .into_iter()
                            .find(|f| sandbox.join(f).is_file())
                            .unwrap_or("server.py");
                        ServerConfig::new(".venv/bin/python", vec![script.into()])
                    },
                };
                DeployPlan {
                    commands: vec!["python3 -m venv .venv".into(), install.into()],
                    launch: Some(launch),
                }
            },
            ManifestDetails::Rust { package } => DeployPlan {
                commands: vec!["cargo build --release".into()],
                launch: package
                    .as_ref()
                    .map(|p| ServerConfig::new(format!("./target/release/{p}"), vec![])),
            },
            ManifestDetails::Go { .. } => DeployPlan {
                commands: vec!["go build -o mcp-server .".into()],
                launch: Some(ServerConfig::new("./mcp-server", vec![])),
            },
        }
    }
}
