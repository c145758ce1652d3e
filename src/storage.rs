//! Local persistence of the cycle materials.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
}

/// Where downloaded materials and computed diffs are kept.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    /// Persist `data` as `name` in `directory`, returning its path.
    ///
    /// A file that already exists is never overwritten: its path is returned and
    /// `data` is discarded.
    fn persist(&self, directory: &str, name: &str, data: &[u8]) -> Result<PathBuf, StorageError>;

    fn load(&self, path: &Path) -> Result<Vec<u8>, StorageError>;
}

/// A [`Storage`] backed by a directory of the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for LocalStorage {
    fn persist(&self, directory: &str, name: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let directory = self.root.join(directory);
        let path = directory.join(name);
        let write_error = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&directory).map_err(write_error)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(data).map_err(write_error)?;
                debug!("persisted {}", path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} already exists, keeping it", path.display());
            }
            Err(e) => return Err(write_error(e)),
        }
        Ok(path)
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        fs::read(path).map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let path = storage.persist("plans", "1.pb", b"first").unwrap();
        assert_eq!(path, dir.path().join("plans").join("1.pb"));
        let again = storage.persist("plans", "1.pb", b"second").unwrap();
        assert_eq!(path, again);
        assert_eq!(storage.load(&path).unwrap(), b"first");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(matches!(
            storage.load(&dir.path().join("missing")),
            Err(StorageError::Read { .. })
        ));
    }
}
