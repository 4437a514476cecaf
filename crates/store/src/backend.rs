//! Durable document persistence.
//!
//! Backends are blocking; the store calls them from `spawn_blocking`.

use std::{
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::debug;

use crate::error::{Context, Result, StoreError};

/// Whole-document key/value persistence.
pub trait DocumentBackend: Send + Sync {
    /// Read the last committed document text, `None` if nothing was ever committed.
    fn read(&self) -> Result<Option<String>>;

    /// Replace the committed document. Must be atomic: after a crash either the
    /// old or the new text is visible, never a mix.
    fn commit(&self, text: &str) -> Result<()>;
}

/// JSON file on disk, written via temp file + rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentBackend for FileBackend {
    fn read(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    fn commit(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = text.len(), "committed plugin document");
        Ok(())
    }
}

/// In-process backend for isolated instances and tests.
#[derive(Default)]
pub struct MemoryBackend {
    text: Mutex<Option<String>>,
    fail_commits: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(Some(text.into())),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Make every following commit fail, simulating a storage outage.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the committed text behind the store's back (another writer).
    pub fn replace_text(&self, text: impl Into<String>) {
        if let Ok(mut slot) = self.text.lock() {
            *slot = Some(text.into());
        }
    }

    pub fn text(&self) -> Option<String> {
        self.text.lock().ok().and_then(|slot| slot.clone())
    }
}

impl DocumentBackend for MemoryBackend {
    fn read(&self) -> Result<Option<String>> {
        let slot = self
            .text
            .lock()
            .map_err(|_| StoreError::message("memory backend lock poisoned"))?;
        Ok(slot.clone())
    }

    fn commit(&self, text: &str) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(
                "simulated commit failure",
            )));
        }
        let mut slot = self
            .text
            .lock()
            .map_err(|_| StoreError::message("memory backend lock poisoned"))?;
        *slot = Some(text.to_string());
        Ok(())
    }
}
