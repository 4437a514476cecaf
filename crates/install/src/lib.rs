//! Plugin installation: repository tarballs, local zip archives, remote
//! registrations, and discovery of sandboxes already on disk.
//!
//! Every local plugin lives in its own sandbox at `<plugins_dir>/<id>/`.
//! Archives are unpacked into a hidden staging directory and only renamed into
//! place once a manifest has been found, so a half-extracted plugin is never
//! visible under its final name.

pub mod archive;
pub mod error;
pub mod installer;
pub mod manifest;

pub use {
    error::{InstallError, Result},
    installer::{Installer, parse_source},
    manifest::{
        DESCRIPTOR_FILE, DetectedManifest, ManifestDetails, ManifestInfo, ManifestKind,
        PluginDescriptor, detect_manifest,
    },
};
