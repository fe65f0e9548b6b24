//! Key-value persistence contract and its two implementations.
//!
//! `FileKvStore` keeps one file per name under a private directory and
//! replaces files atomically (temp file + rename). Both stores accept an
//! optional byte quota and reject writes that would exceed it with
//! [`KvError::QuotaExceeded`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    pub fn is_quota(&self) -> bool {
        matches!(self, KvError::QuotaExceeded)
    }
}

/// Named blob storage.
pub trait KvStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value` under `name`, replacing any previous value.
    fn set(&self, name: &str, value: &[u8]) -> Result<(), KvError>;

    fn remove(&self, name: &str) -> Result<(), KvError>;
}

/// Directory-backed store, one file per name.
pub struct FileKvStore {
    base_path: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `base_path`.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, KvError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&base_path)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&base_path, perms)?;
        }

        Ok(Self {
            base_path,
            quota_bytes: None,
        })
    }

    /// Limit the total size of stored values.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // Hex keeps arbitrary names filesystem-safe
        self.base_path.join(format!("{}.kv", hex::encode(name.as_bytes())))
    }

    fn used_bytes_excluding(&self, skip: &Path) -> Result<u64, KvError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();
            if path == skip || path.extension().and_then(|e| e.to_str()) != Some("kv") {
                continue;
            }
            total += entry.metadata()?.len();
        }
        Ok(total)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(name);
        if let Some(quota) = self.quota_bytes {
            if self.used_bytes_excluding(&path)? + value.len() as u64 > quota {
                return Err(KvError::QuotaExceeded);
            }
        }

        // Write to a temp file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, value)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&temp_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&temp_path, perms)?;
        }

        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), KvError> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            values: RwLock::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.values().map(Vec::len).sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.contains_key(name)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, KvError> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), KvError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if let Some(quota) = self.quota_bytes {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != name)
                .map(|(_, v)| v.len())
                .sum();
            if others + value.len() > quota {
                return Err(KvError::QuotaExceeded);
            }
        }
        values.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), KvError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("kv")).unwrap();

        assert_eq!(store.get("feeds").unwrap(), None);
        store.set("feeds", b"[1,2,3]").unwrap();
        store.set("feeds", b"[4]").unwrap();
        assert_eq!(store.get("feeds").unwrap(), Some(b"[4]".to_vec()));

        store.remove("feeds").unwrap();
        assert_eq!(store.get("feeds").unwrap(), None);
        store.remove("feeds").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("kv")).unwrap();
        store.set("sync_metadata", b"{}").unwrap();

        let dir_mode = fs::metadata(store.base_path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = fs::metadata(store.path_for("sync_metadata"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_quota_counts_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap().with_quota(10);

        store.set("a", &[0; 6]).unwrap();
        assert!(store.set("b", &[0; 5]).unwrap_err().is_quota());
        // Replacing "a" frees its old bytes
        store.set("a", &[0; 10]).unwrap();
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_memory_store_quota() {
        let store = MemoryKvStore::with_quota(8);
        store.set("a", &[1; 4]).unwrap();
        store.set("b", &[2; 4]).unwrap();
        assert!(matches!(store.set("c", &[3]), Err(KvError::QuotaExceeded)));
        assert!(!store.contains("c"));

        store.remove("a").unwrap();
        store.set("c", &[3]).unwrap();
        assert_eq!(store.used_bytes(), 5);
    }
}
