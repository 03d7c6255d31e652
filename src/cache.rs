use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error;

pub const DEFAULT_DATA_DIR: &str = "~/.config/car-catalog";

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("data directory path {path} is invalid: {reason}")]
    Path { path: String, reason: String },
    #[error("error accessing stored {key:?}")]
    Io {
        key: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

/// Keyed store of JSON documents, one document per key.
pub trait Storage: Send + Sync {
    /// Returns None if nothing is stored under the key.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Stores each key as `<key>.json` inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        FileStorage { dir: dir.into() }
    }

    /// Expands `~` and environment variables in the directory path.
    pub fn from_path_spec(spec: &str) -> Result<Self, StorageError> {
        let path = shellexpand::full(spec).map_err(|e| StorageError::Path {
            path: spec.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(FileStorage::new(path.into_owned()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_owned(),
        source: Arc::new(source),
    }
}

fn read_if_found(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        read_if_found(&self.path_for(key)).map_err(|e| io_error(key, e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(key, e))?;
        let path = self.path_for(key);
        // Write beside the target and rename so readers never see half a file
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        std::fs::write(&tmp, value).map_err(|e| io_error(key, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(key, e))?;
        debug!("Wrote {} bytes to {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

/// In-process storage, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.get("mbk_cars").unwrap(), None);
        storage.set("mbk_cars", "[]").unwrap();
        assert_eq!(storage.get("mbk_cars").unwrap().as_deref(), Some("[]"));
        assert!(dir.path().join("nested/mbk_cars.json").exists());

        storage.set("mbk_cars", "[1]").unwrap();
        assert_eq!(storage.get("mbk_cars").unwrap().as_deref(), Some("[1]"));

        storage.remove("mbk_cars").unwrap();
        storage.remove("mbk_cars").unwrap();
        assert_eq!(storage.get("mbk_cars").unwrap(), None);
    }

    #[test]
    fn path_spec_expands_env() {
        std::env::set_var("CAR_CATALOG_TEST_DIR", "/tmp/catalog");
        let storage = FileStorage::from_path_spec("$CAR_CATALOG_TEST_DIR/data").unwrap();
        assert_eq!(storage.dir(), Path::new("/tmp/catalog/data"));

        let err = FileStorage::from_path_spec("$CAR_CATALOG_UNSET_VARIABLE/data").unwrap_err();
        assert!(matches!(err, StorageError::Path { .. }));
    }

    #[test]
    fn memory_storage_is_shared_between_clones() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.set("k", "v").unwrap();
        assert_eq!(other.get("k").unwrap().as_deref(), Some("v"));
        other.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
    }
}
