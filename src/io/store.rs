//! Filesystem store setup for Zarr containers.
//!
//! Creating a destination records which directory was the first one this
//! process created, so a failed open or a discarded writer can remove exactly
//! what it made and nothing that existed before.
//!
//! A prepared destination also holds a marker file next to the container
//! (`<container>.lock`) for as long as a writer owns it. A second writer on
//! the same path is refused before anything on disk is touched.

use crate::error::{CoherenceError, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::filesystem::FilesystemStore;

/// Suffix appended to the container path to name its writer marker.
pub const WRITER_LOCK_SUFFIX: &str = ".lock";

/// A destination directory prepared for a new container.
#[derive(Debug)]
pub struct PreparedDestination {
    /// The container directory itself
    pub path: PathBuf,

    /// Topmost directory created by `prepare_destination`, if any
    pub created_root: Option<PathBuf>,

    /// Marker held while a writer owns `path`
    pub lock_path: PathBuf,
}

impl PreparedDestination {
    /// Remove everything this preparation created, plus the container itself.
    pub fn remove(&self) -> Result<()> {
        let target = self.created_root.as_deref().unwrap_or(&self.path);
        remove_dir_if_exists(target)?;
        self.release()
    }

    /// Give up ownership of the container, leaving its contents in place.
    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoherenceError::storage_unavailable(&self.lock_path, e)),
        }
    }
}

/// Path of the writer marker for the container at `path`.
pub fn writer_lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(WRITER_LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Create (or overwrite) the container directory at `path` and take ownership of it.
///
/// Fails with `StorageUnavailable` if another writer holds the destination,
/// in which case nothing is touched. An existing directory at `path` is
/// deleted once ownership is taken. Any ancestors created along the way are
/// removed again if the directory cannot be created.
pub fn prepare_destination(path: &Path) -> Result<PreparedDestination> {
    let existed = path.exists();
    if existed && !path.is_dir() {
        return Err(CoherenceError::storage_unavailable(
            path,
            "destination exists and is not a directory",
        ));
    }

    let created_root = if existed {
        Some(path.to_path_buf())
    } else {
        first_missing_ancestor(path)
    };
    let lock_path = acquire_writer_lock(path, created_root.as_deref())?;
    let prepared = PreparedDestination {
        path: path.to_path_buf(),
        created_root,
        lock_path,
    };

    if existed {
        tracing::info!("Overwriting existing container at {}", path.display());
        if let Err(e) = std::fs::remove_dir_all(path) {
            let _ = prepared.release();
            return Err(CoherenceError::storage_unavailable(path, e));
        }
    }

    if let Err(e) = std::fs::create_dir_all(path) {
        let _ = prepared.remove();
        return Err(CoherenceError::storage_unavailable(path, e));
    }

    Ok(prepared)
}

/// Create the parent directory of `path` and the marker beside it.
fn acquire_writer_lock(path: &Path, created_root: Option<&Path>) -> Result<PathBuf> {
    let lock_path = writer_lock_path(path);
    let cleanup = || {
        if let Some(root) = created_root.filter(|root| *root != path) {
            let _ = remove_dir_if_exists(root);
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            cleanup();
            return Err(CoherenceError::storage_unavailable(path, e));
        }
    }

    match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
        Ok(_) => Ok(lock_path),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(CoherenceError::storage_unavailable(
            path,
            format!("destination is held by another writer ({} exists)", lock_path.display()),
        )),
        Err(e) => {
            cleanup();
            Err(CoherenceError::storage_unavailable(path, e))
        }
    }
}

/// Open a Zarr filesystem store rooted at `path` for writing.
pub fn create_store(path: &Path) -> Result<Arc<FilesystemStore>> {
    let store = FilesystemStore::new(path).map_err(|e| CoherenceError::storage_unavailable(path, e))?;
    Ok(Arc::new(store))
}

/// Open an existing Zarr filesystem store rooted at `path` for reading.
pub fn open_store(path: &Path) -> Result<Arc<FilesystemStore>> {
    if !path.is_dir() {
        return Err(CoherenceError::input_unavailable(path, "no container directory"));
    }
    let store = FilesystemStore::new(path).map_err(|e| CoherenceError::input_unavailable(path, e))?;
    Ok(Arc::new(store))
}

/// Remove a directory tree, treating a missing directory as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoherenceError::storage_unavailable(path, e)),
    }
}

/// The topmost ancestor of `path` (inclusive) that does not exist yet.
fn first_missing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut missing = None;
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() || ancestor.exists() {
            break;
        }
        missing = Some(ancestor.to_path_buf());
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_nested() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("a").join("b").join("out.zarr");

        let prepared = prepare_destination(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(prepared.created_root.as_deref(), Some(temp.path().join("a").as_path()));

        prepared.remove().unwrap();
        assert!(!temp.path().join("a").exists());
        assert!(temp.path().exists());
    }

    #[test]
    fn test_prepare_overwrites_existing() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.zarr");
        std::fs::create_dir_all(target.join("stale")).unwrap();

        let prepared = prepare_destination(&target).unwrap();
        assert!(target.is_dir());
        assert!(!target.join("stale").exists());
        assert_eq!(prepared.created_root.as_deref(), Some(target.as_path()));
    }

    #[test]
    fn test_prepare_under_file_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let target = blocker.join("nested").join("out.zarr");

        let result = prepare_destination(&target);
        assert!(matches!(result, Err(CoherenceError::StorageUnavailable { .. })));
        assert!(!target.exists());
        assert!(blocker.is_file());
    }

    #[test]
    fn test_prepare_rejects_existing_file() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.zarr");
        std::fs::write(&target, b"file").unwrap();

        assert!(matches!(
            prepare_destination(&target),
            Err(CoherenceError::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn test_prepare_holds_destination() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.zarr");

        let prepared = prepare_destination(&target).unwrap();
        assert!(prepared.lock_path.is_file());
        std::fs::write(target.join("chunk"), b"data").unwrap();

        assert!(matches!(
            prepare_destination(&target),
            Err(CoherenceError::StorageUnavailable { .. })
        ));
        assert!(target.join("chunk").exists());

        prepared.release().unwrap();
        assert!(!writer_lock_path(&target).exists());
        assert!(target.join("chunk").exists());

        let again = prepare_destination(&target).unwrap();
        assert!(!target.join("chunk").exists());
        again.remove().unwrap();
        assert!(!target.exists());
        assert!(!again.lock_path.exists());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        assert!(remove_dir_if_exists(&temp.path().join("missing")).is_ok());
    }

    #[test]
    fn test_open_store_missing() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            open_store(&temp.path().join("missing.zarr")),
            Err(CoherenceError::InputUnavailable { .. })
        ));
    }
}
