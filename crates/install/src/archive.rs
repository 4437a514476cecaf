//! Archive extraction into staging directories. All functions here block.

use std::{
    io::Read,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{InstallError, Result};

/// Reject absolute paths and parent traversal. Returns `None` for empty paths.
pub fn sanitize_archive_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(InstallError::archive(format!(
                    "archive contains unsafe path component: {}",
                    path.display()
                )));
            },
        }
    }
    if clean.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(clean))
}

/// Unpack a gzipped tarball into `dest`. Links are skipped.
pub fn extract_tarball(bytes: &[u8], dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let canonical_dest = std::fs::canonicalize(dest)?;
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut files = 0;

    let entries = archive
        .entries()
        .map_err(|e| InstallError::archive(format!("unreadable tarball: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| InstallError::archive(format!("bad tar entry: {e}")))?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            warn!("skipping link entry in tarball");
            continue;
        }
        // pax headers carry no file data
        if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() {
            continue;
        }

        let raw = entry
            .path()
            .map_err(|e| InstallError::archive(format!("bad tar entry path: {e}")))?
            .into_owned();
        let Some(rel) = sanitize_archive_path(&raw)? else {
            continue;
        };
        let out = dest.join(&rel);
        ensure_inside(&canonical_dest, &out)?;

        if kind.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        entry
            .unpack(&out)
            .map_err(|e| InstallError::archive(format!("failed to unpack {}: {e}", rel.display())))?;
        files += 1;
    }
    debug!(dest = %dest.display(), files, "extracted tarball");
    Ok(files)
}

/// Unpack a zip file into `dest`.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| InstallError::archive(format!("failed to read zip archive: {e}")))?;

    std::fs::create_dir_all(dest)?;
    let canonical_dest = std::fs::canonicalize(dest)?;
    let mut files = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::archive(format!("failed to read zip entry: {e}")))?;
        let Some(raw) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(InstallError::archive(format!(
                "archive contains unsafe path: {}",
                entry.name()
            )));
        };
        let Some(rel) = sanitize_archive_path(&raw)? else {
            continue;
        };
        let out = dest.join(&rel);
        ensure_inside(&canonical_dest, &out)?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| InstallError::archive(format!("failed to read {}: {e}", rel.display())))?;
        std::fs::write(&out, buf)?;
        files += 1;
    }
    debug!(dest = %dest.display(), files, "extracted zip archive");
    Ok(files)
}

fn ensure_inside(root: &Path, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
        let canonical_parent = std::fs::canonicalize(parent)?;
        if !canonical_parent.starts_with(root) {
            return Err(InstallError::archive("archive entry escaped staging directory"));
        }
    }
    if out.exists() && std::fs::symlink_metadata(out)?.file_type().is_symlink() {
        return Err(InstallError::archive(
            "archive entry resolves to a symlink destination",
        ));
    }
    Ok(())
}

/// The directory holding the plugin files: `staging` itself, or its only child
/// when the archive wraps everything in one top-level directory.
pub fn content_root(staging: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(staging)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != ".DS_Store" && e.file_name() != "__MACOSX");
    match (entries.next(), entries.next()) {
        (Some(only), None) if only.file_type().is_ok_and(|t| t.is_dir()) => Ok(only.path()),
        _ => Ok(staging.to_path_buf()),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn zip_file(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("plugin.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        for (name, body) in files {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_sanitize_rejects_parent_dir() {
        assert!(sanitize_archive_path(Path::new("root/../../etc/passwd")).is_err());
        assert!(sanitize_archive_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_sanitize_accepts_normal_path() {
        let clean = sanitize_archive_path(Path::new("./root/src/index.js"))
            .unwrap()
            .unwrap();
        assert_eq!(clean, PathBuf::from("root/src/index.js"));
        assert!(sanitize_archive_path(Path::new("./")).unwrap().is_none());
    }

    #[test]
    fn test_tarball_with_wrapping_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        let bytes = tarball(&[
            ("acme-weather-abc123/package.json", "{}"),
            ("acme-weather-abc123/src/index.js", "console.log(1)"),
        ]);
        assert_eq!(extract_tarball(&bytes, &staging).unwrap(), 2);
        let root = content_root(&staging).unwrap();
        assert!(root.ends_with("acme-weather-abc123"));
        assert!(root.join("src/index.js").is_file());
    }

    #[test]
    fn test_garbage_tarball_is_archive_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = extract_tarball(b"definitely not gzip", tmp.path()).unwrap_err();
        assert!(matches!(err, InstallError::ArchiveInvalid { .. }));
    }

    #[test]
    fn test_zip_flat_layout_is_its_own_root() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = zip_file(tmp.path(), &[
            ("package.json", "{}"),
            ("index.js", "1"),
        ]);
        let staging = tmp.path().join("staging");
        extract_zip(&archive, &staging).unwrap();
        assert_eq!(content_root(&staging).unwrap(), staging);
    }

    #[test]
    fn test_zip_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = zip_file(tmp.path(), &[("../evil.txt", "x")]);
        let err = extract_zip(&archive, &tmp.path().join("staging")).unwrap_err();
        assert!(matches!(err, InstallError::ArchiveInvalid { .. }));
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[test]
    fn test_not_a_zip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fake.zip");
        std::fs::write(&path, "hello").unwrap();
        let err = extract_zip(&path, &tmp.path().join("staging")).unwrap_err();
        assert!(matches!(err, InstallError::ArchiveInvalid { .. }));
    }
}
