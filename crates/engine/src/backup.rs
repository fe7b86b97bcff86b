//! Backup store and atomic file replacement.
//!
//! Before the first transform of an asset replaces its file, the pristine
//! original is copied into the backup root. Subsequent transforms of the same
//! asset reuse that copy, so restore always brings back the true original no
//! matter how many transforms were chained on top of it. A new asset at the
//! same path always takes a fresh copy.

use crate::marker::{MarkerStore, OptimisationMarker};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while backing up or restoring files.
#[derive(Debug, Error)]
pub enum BackupError {
    /// No backup exists for the file being restored.
    #[error("no backup exists for {0}")]
    MissingBackup(PathBuf),

    /// The file to back up is gone.
    #[error("source file {0} does not exist")]
    MissingSource(PathBuf),

    /// A filesystem step failed.
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> BackupError + 'a {
        move |source| BackupError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Short, stable directory name for a key (first 16 hex digits of its SHA-256).
pub fn bucket_name(key: &[u8]) -> String {
    let mut name = hex::encode(Sha256::digest(key));
    name.truncate(16);
    name
}

/// Keeps one pristine copy per original path.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    markers: Arc<dyn MarkerStore>,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>, markers: Arc<dyn MarkerStore>) -> Self {
        Self {
            root: root.into(),
            markers,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backup location for `original`: `<root>/<hash of path>/<file name>`.
    ///
    /// Hashing the full path keeps same-named files from different folders apart
    /// while the file name stays readable.
    pub fn backup_path(&self, original: &Path) -> PathBuf {
        let bucket = bucket_name(original.as_os_str().as_encoded_bytes());
        let name = original
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "original".into());
        self.root.join(bucket).join(name)
    }

    /// Copy `original` into the store, or reuse `existing`, the backup the
    /// asset already recorded, while that file is still present.
    ///
    /// A file left at [`backup_path`](Self::backup_path) by an earlier asset is
    /// overwritten. The copy goes to a temporary name first and is renamed into
    /// place, so a crash never leaves a truncated backup that would later be
    /// restored.
    pub fn backup(&self, original: &Path, existing: Option<&Path>) -> Result<PathBuf, BackupError> {
        if let Some(existing) = existing.filter(|p| p.is_file()) {
            debug!(original = %original.display(), backup = %existing.display(), "reusing asset backup");
            return Ok(existing.to_path_buf());
        }
        let backup = self.backup_path(original);
        if !original.is_file() {
            return Err(BackupError::MissingSource(original.to_path_buf()));
        }

        let dir = backup.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(BackupError::io("create backup directory", dir))?;

        let partial = backup.with_extension("partial");
        fs::copy(original, &partial).map_err(BackupError::io("copy original to", &partial))?;
        fs::rename(&partial, &backup).map_err(BackupError::io("finalize backup", &backup))?;

        debug!(original = %original.display(), backup = %backup.display(), "backup created");
        Ok(backup)
    }

    /// Put the backed-up original back at `original`.
    ///
    /// Returns the restored file's size. The restored file is marked as the
    /// original so it is not mistaken for engine output.
    pub fn restore(&self, original: &Path, backup: &Path) -> Result<u64, BackupError> {
        if !backup.is_file() {
            return Err(BackupError::MissingBackup(original.to_path_buf()));
        }
        atomic_replace(original, backup)?;
        if let Err(e) = self.markers.set(original, OptimisationMarker::Original) {
            debug!(path = %original.display(), error = %e, "could not mark restored file");
        }
        let bytes = fs::metadata(original)
            .map_err(BackupError::io("stat restored file", original))?
            .len();
        Ok(bytes)
    }

    /// Whether the file carries the "already optimised" marker. Unreadable
    /// markers count as absent.
    pub fn is_optimised(&self, path: &Path) -> bool {
        match self.markers.get(path) {
            Ok(marker) => marker == Some(OptimisationMarker::Optimised),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "marker unreadable");
                false
            }
        }
    }

    pub fn marker(&self, path: &Path) -> Option<OptimisationMarker> {
        self.markers.get(path).ok().flatten()
    }

    pub fn set_marker(&self, path: &Path, marker: OptimisationMarker) -> io::Result<()> {
        self.markers.set(path, marker)
    }

    pub fn clear_marker(&self, path: &Path) -> io::Result<()> {
        self.markers.clear(path)
    }
}

/// Replace `target` with the contents of `replacement` in one rename.
///
/// The replacement is copied next to the target first so the final rename
/// never crosses a filesystem; readers see either the old or the new file.
/// The target's permissions are carried over.
pub fn atomic_replace(target: &Path, replacement: &Path) -> Result<(), BackupError> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = dir.join(format!(".{}.media-optimiser.tmp", name));

    fs::copy(replacement, &staging).map_err(BackupError::io("stage replacement for", target))?;

    if let Ok(meta) = fs::metadata(target) {
        let _ = fs::set_permissions(&staging, meta.permissions());
    }

    if let Err(e) = fs::rename(&staging, target) {
        let _ = fs::remove_file(&staging);
        return Err(BackupError::Io {
            action: "replace",
            path: target.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}
