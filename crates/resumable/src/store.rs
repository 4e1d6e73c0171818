//! Durable byte storage for checkpoint artifacts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::{CheckpointError, Result};

/// Trait for artifact storage backends.
///
/// Every I/O failure surfaces as [`CheckpointError::Storage`] carrying the
/// path. Stores never retry.
pub trait ArtifactStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and all of its parents.
    fn mkdirs(&self, path: &Path) -> Result<()>;

    /// Open an artifact for reading. The handle is released on drop.
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>>;

    /// Replace the artifact at `path` with `data`.
    ///
    /// Readers observe either the previous content or the new content,
    /// never a partially written file.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Files directly inside `dir`, sorted.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Read a whole artifact.
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| CheckpointError::storage(path, e))?;
        Ok(data)
    }
}

/// Local filesystem store.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStore;

impl ArtifactStore for LocalStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mkdirs(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| CheckpointError::storage(path, e))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>> {
        let file = fs::File::open(path).map_err(|e| CheckpointError::storage(path, e))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        self.mkdirs(parent)?;

        // Temp file lives next to the target so the rename stays on one filesystem
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| CheckpointError::storage(parent, e))?;
        tmp.write_all(data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CheckpointError::storage(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| CheckpointError::storage(path, e.error))?;

        tracing::debug!(path = %path.display(), bytes = data.len(), "Wrote artifact");
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| CheckpointError::storage(dir, e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();

        files.sort();
        Ok(files)
    }
}

/// In-process store. Counts writes so callers can verify who wrote what.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: RwLock<BTreeSet<PathBuf>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_atomic` and `mkdirs` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Paths of all stored files.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
            || self
                .dirs
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(path)
    }

    fn mkdirs(&self, path: &Path) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        for dir in path.ancestors().filter(|p| !p.as_os_str().is_empty()) {
            dirs.insert(dir.to_path_buf());
        }
        Ok(())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        match files.get(path) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(CheckpointError::storage(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such artifact"),
            )),
        }
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !self.exists(dir) && !self.paths().iter().any(|p| p.parent() == Some(dir)) {
            return Err(CheckpointError::storage(
                dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
            ));
        }
        Ok(self
            .paths()
            .into_iter()
            .filter(|p| p.parent() == Some(dir))
            .collect())
    }
}
