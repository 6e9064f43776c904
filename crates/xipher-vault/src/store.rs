//! Key-value persistence surface the vault writes through.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::vault::VaultError;

/// Byte-valued key-value storage. `get` of a missing id is `Ok(None)`;
/// `remove` of a missing id succeeds.
pub trait KvStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError>;
    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError>;
    fn remove(&self, id: &str) -> Result<(), VaultError>;
}

impl<T: KvStore + ?Sized> KvStore for Box<T> {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        (**self).get(id)
    }
    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError> {
        (**self).set(id, value)
    }
    fn remove(&self, id: &str) -> Result<(), VaultError> {
        (**self).remove(id)
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        (**self).get(id)
    }
    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError> {
        (**self).set(id, value)
    }
    fn remove(&self, id: &str) -> Result<(), VaultError> {
        (**self).remove(id)
    }
}

/// Process-local store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(id).cloned())
    }

    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(id.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id);
        Ok(())
    }
}

/// One file per id under a directory. Writes are atomic (temp → rename) and,
/// on Unix, readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, VaultError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(VaultError::Storage(format!("invalid record id: {id:?}")));
        }
        Ok(self.dir.join(id))
    }
}

impl KvStore for FileStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let path = self.path_for(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError> {
        let path = self.path_for(id)?;
        let tmp = self.dir.join(format!(".{id}.tmp"));
        fs::write(&tmp, value)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(id, path = %path.display(), "vault record written");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), VaultError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
