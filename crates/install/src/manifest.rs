//! Manifest detection inside a plugin sandbox.
//!
//! Checked in priority order: `mcp-plugin.json`, `package.json`,
//! `pyproject.toml` / `requirements.txt`, `Cargo.toml`, `go.mod`.

use std::path::{Path, PathBuf};

use {
    mcpdock_common::{EnvVarSpec, PluginMetadata},
    serde::Deserialize,
    tracing::warn,
};

use crate::error::{InstallError, Result};

/// Explicit plugin descriptor file.
pub const DESCRIPTOR_FILE: &str = "mcp-plugin.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Descriptor,
    Node,
    Python,
    Rust,
    Go,
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Descriptor => "descriptor",
            Self::Node => "node",
            Self::Python => "python",
            Self::Rust => "rust",
            Self::Go => "go",
        };
        f.write_str(s)
    }
}

/// Contents of `mcp-plugin.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    /// Explicit deploy commands, run in order.
    #[serde(default)]
    pub deploy: Vec<String>,
}

/// Descriptive fields pulled from whichever manifest was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDetails {
    Descriptor(PluginDescriptor),
    Node {
        main: Option<String>,
        build_script: bool,
        start_script: bool,
    },
    Python {
        pyproject: bool,
        package: Option<String>,
    },
    Rust {
        package: Option<String>,
    },
    Go {
        module: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedManifest {
    /// The manifest file that was matched.
    pub path: PathBuf,
    pub info: ManifestInfo,
    pub details: ManifestDetails,
}

impl DetectedManifest {
    pub fn kind(&self) -> ManifestKind {
        match self.details {
            ManifestDetails::Descriptor(_) => ManifestKind::Descriptor,
            ManifestDetails::Node { .. } => ManifestKind::Node,
            ManifestDetails::Python { .. } => ManifestKind::Python,
            ManifestDetails::Rust { .. } => ManifestKind::Rust,
            ManifestDetails::Go { .. } => ManifestKind::Go,
        }
    }

    pub fn descriptor(&self) -> Option<&PluginDescriptor> {
        match &self.details {
            ManifestDetails::Descriptor(d) => Some(d),
            _ => None,
        }
    }

    /// Fill empty metadata fields from the manifest.
    pub fn fill_metadata(&self, meta: &mut PluginMetadata) {
        fill(&mut meta.name, &self.info.name);
        fill(&mut meta.description, &self.info.description);
        fill(&mut meta.author, &self.info.author);
        fill(&mut meta.version, &self.info.version);
    }
}

fn fill(slot: &mut String, value: &Option<String>) {
    if slot.trim().is_empty()
        && let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty())
    {
        *slot = v.to_string();
    }
}

/// Find the highest-priority manifest in `dir`. Blocking.
///
/// A malformed `mcp-plugin.json` is an error; malformed ecosystem manifests
/// still count as present, with no descriptive fields.
pub fn detect_manifest(dir: &Path) -> Result<Option<DetectedManifest>> {
    let descriptor = dir.join(DESCRIPTOR_FILE);
    if descriptor.is_file() {
        let text = std::fs::read_to_string(&descriptor)?;
        let parsed: PluginDescriptor = serde_json::from_str(&text)
            .map_err(|e| InstallError::archive(format!("{DESCRIPTOR_FILE}: {e}")))?;
        let info = ManifestInfo {
            name: non_empty(&parsed.name),
            description: non_empty(&parsed.description),
            author: non_empty(&parsed.author),
            version: non_empty(&parsed.version),
        };
        return Ok(Some(DetectedManifest {
            path: descriptor,
            info,
            details: ManifestDetails::Descriptor(parsed),
        }));
    }

    let package_json = dir.join("package.json");
    if package_json.is_file() {
        return Ok(Some(read_package_json(package_json)));
    }

    let pyproject = dir.join("pyproject.toml");
    if pyproject.is_file() {
        let table = read_toml(&pyproject);
        let project = table.as_ref().and_then(|t| t.get("project"));
        let info = toml_info(project);
        return Ok(Some(DetectedManifest {
            path: pyproject,
            details: ManifestDetails::Python {
                pyproject: true,
                package: info.name.clone(),
            },
            info,
        }));
    }

    let requirements = dir.join("requirements.txt");
    if requirements.is_file() {
        return Ok(Some(DetectedManifest {
            path: requirements,
            info: ManifestInfo::default(),
            details: ManifestDetails::Python {
                pyproject: false,
                package: None,
            },
        }));
    }

    let cargo = dir.join("Cargo.toml");
    if cargo.is_file() {
        let table = read_toml(&cargo);
        let info = toml_info(table.as_ref().and_then(|t| t.get("package")));
        return Ok(Some(DetectedManifest {
            path: cargo,
            details: ManifestDetails::Rust {
                package: info.name.clone(),
            },
            info,
        }));
    }

    let go_mod = dir.join("go.mod");
    if go_mod.is_file() {
        let module = std::fs::read_to_string(&go_mod).ok().and_then(|text| {
            text.lines()
                .find_map(|l| l.trim().strip_prefix("module "))
                .map(|m| m.trim().to_string())
        });
        let name = module
            .as_deref()
            .and_then(|m| m.rsplit('/').next())
            .map(str::to_string);
        return Ok(Some(DetectedManifest {
            path: go_mod,
            info: ManifestInfo {
                name,
                ..Default::default()
            },
            details: ManifestDetails::Go { module },
        }));
    }

    Ok(None)
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    author: Option<serde_json::Value>,
    main: Option<String>,
    #[serde(default)]
    scripts: std::collections::BTreeMap<String, String>,
}

fn read_package_json(path: PathBuf) -> DetectedManifest {
    let pkg = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| {
            serde_json::from_str::<PackageJson>(&text).map_err(|e| e.to_string())
        })
        .unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable package.json");
            PackageJson::default()
        });

    let author = match pkg.author {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Object(obj)) => obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    };

    DetectedManifest {
        path,
        info: ManifestInfo {
            name: pkg.name,
            description: pkg.description,
            author,
            version: pkg.version,
        },
        details: ManifestDetails::Node {
            main: pkg.main,
            build_script: pkg.scripts.contains_key("build"),
            start_script: pkg.scripts.contains_key("start"),
        },
    }
}

fn read_toml(path: &Path) -> Option<toml::Table> {
    let text = std::fs::read_to_string(path).ok()?;
    match text.parse::<toml::Table>() {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unparseable toml manifest");
            None
        },
    }
}

fn toml_info(section: Option<&toml::Value>) -> ManifestInfo {
    let field = |key: &str| {
        section
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let author = section
        .and_then(|s| s.get("authors"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|first| {
            first
                .as_str()
                .map(str::to_string)
                .or_else(|| first.get("name")?.as_str().map(str::to_string))
        });
    ManifestInfo {
        name: field("name"),
        description: field("description"),
        author,
        version: field("version"),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.trim().is_empty()).then(|| s.to_string())
}
