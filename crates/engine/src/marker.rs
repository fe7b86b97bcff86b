//! Optimisation marker stored as an extended attribute.
//!
//! Files produced by the engine carry `user.media-optimiser.status = true` so a
//! later request (or a watcher seeing our own write) does not optimise them a
//! second time. Restoring the original sets the value to `original`.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Extended attribute holding the marker value.
pub const MARKER_ATTRIBUTE: &str = "user.media-optimiser.status";

#[cfg(target_os = "linux")]
const NO_ATTRIBUTE: i32 = libc::ENODATA;
#[cfg(not(target_os = "linux"))]
const NO_ATTRIBUTE: i32 = libc::ENOATTR;

/// Values the marker can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimisationMarker {
    /// The file is engine output.
    Optimised,
    /// A transform is about to replace the file.
    Pending,
    /// The pristine original was restored.
    Original,
}

impl OptimisationMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimisationMarker::Optimised => "true",
            OptimisationMarker::Pending => "pending",
            OptimisationMarker::Original => "original",
        }
    }

    pub fn parse(value: &[u8]) -> Option<Self> {
        match value {
            b"true" => Some(OptimisationMarker::Optimised),
            b"pending" => Some(OptimisationMarker::Pending),
            b"original" => Some(OptimisationMarker::Original),
            _ => None,
        }
    }
}

impl fmt::Display for OptimisationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where markers live. The filesystem implementation uses xattrs; tests swap
/// in [`MemoryMarkers`] so they do not depend on the filesystem supporting them.
pub trait MarkerStore: Send + Sync + fmt::Debug {
    fn get(&self, path: &Path) -> io::Result<Option<OptimisationMarker>>;
    fn set(&self, path: &Path, marker: OptimisationMarker) -> io::Result<()>;
    fn clear(&self, path: &Path) -> io::Result<()>;
}

/// Markers stored in the file's extended attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrMarkers;

impl MarkerStore for XattrMarkers {
    fn get(&self, path: &Path) -> io::Result<Option<OptimisationMarker>> {
        Ok(xattr::get(path, MARKER_ATTRIBUTE)?.and_then(|value| OptimisationMarker::parse(&value)))
    }

    fn set(&self, path: &Path, marker: OptimisationMarker) -> io::Result<()> {
        xattr::set(path, MARKER_ATTRIBUTE, marker.as_str().as_bytes())
    }

    fn clear(&self, path: &Path) -> io::Result<()> {
        match xattr::remove(path, MARKER_ATTRIBUTE) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(NO_ATTRIBUTE) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory markers keyed by path.
#[derive(Debug, Default)]
pub struct MemoryMarkers {
    markers: Mutex<HashMap<PathBuf, OptimisationMarker>>,
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryMarkers {
    fn get(&self, path: &Path) -> io::Result<Option<OptimisationMarker>> {
        let markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(markers.get(path).copied())
    }

    fn set(&self, path: &Path, marker: OptimisationMarker) -> io::Result<()> {
        let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        markers.insert(path.to_path_buf(), marker);
        Ok(())
    }

    fn clear(&self, path: &Path) -> io::Result<()> {
        let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
        markers.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_marker_values() {
        for marker in [
            OptimisationMarker::Optimised,
            OptimisationMarker::Pending,
            OptimisationMarker::Original,
        ] {
            assert_eq!(OptimisationMarker::parse(marker.as_str().as_bytes()), Some(marker));
        }
        assert_eq!(OptimisationMarker::Optimised.to_string(), "true");
        assert_eq!(OptimisationMarker::parse(b"yes"), None);
    }

    #[test]
    fn test_memory_markers() {
        let store = MemoryMarkers::new();
        let path = Path::new("/photos/a.png");
        assert_eq!(store.get(path).unwrap(), None);

        store.set(path, OptimisationMarker::Optimised).unwrap();
        assert_eq!(store.get(path).unwrap(), Some(OptimisationMarker::Optimised));

        store.clear(path).unwrap();
        store.clear(path).unwrap();
        assert_eq!(store.get(path).unwrap(), None);
    }

    #[test]
    fn test_xattr_markers_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shot.png");
        fs::write(&path, b"png").unwrap();

        let store = XattrMarkers;
        // Some filesystems (tmpfs on older kernels, overlayfs) lack user xattrs
        if store.set(&path, OptimisationMarker::Pending).is_err() {
            return;
        }
        assert_eq!(store.get(&path).unwrap(), Some(OptimisationMarker::Pending));

        store.set(&path, OptimisationMarker::Optimised).unwrap();
        assert_eq!(store.get(&path).unwrap(), Some(OptimisationMarker::Optimised));

        store.clear(&path).unwrap();
        assert_eq!(store.get(&path).unwrap(), None);
        store.clear(&path).unwrap();
    }
}
