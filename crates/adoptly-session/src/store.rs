use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use adoptly_types::models::CredentialPair;

use crate::error::SessionError;

/// Persistence for the credential pair. The coordinator is the only writer.
pub trait CredentialStore: Send + Sync + 'static {
    fn get(&self) -> Option<CredentialPair>;
    fn set(&self, pair: &CredentialPair) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.pair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, pair: &CredentialPair) -> Result<(), SessionError> {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file store: `{"accessToken": ..., "refreshToken": ...}`.
/// The file is read once at open and cached; writes go through a temp file
/// and a rename so a crash never leaves a half-written credential behind.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cached: RwLock<Option<CredentialPair>>,
}

impl FileCredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let cached = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CredentialPair>(&bytes) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!("Ignoring unreadable credential file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SessionError::Store(format!("{}: {}", path.display(), e))),
        };
        debug!("Credential store opened at {}", path.display());
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, pair: &CredentialPair) -> Result<(), SessionError> {
        let store_err = |e: std::io::Error| SessionError::Store(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        let json = serde_json::to_vec_pretty(pair).map_err(|e| SessionError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(store_err)?;
        std::fs::rename(&tmp, &self.path).map_err(store_err)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, pair: &CredentialPair) -> Result<(), SessionError> {
        self.write_file(pair)?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::Store(format!("{}: {}", self.path.display(), e))),
        }
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("adoptly_store_test_{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn memory_store_set_get_clear() {
        let store = MemoryCredentialStore::new();
        assert!(store.get().is_none());

        let pair = CredentialPair::new("access", Some("refresh".into()));
        store.set(&pair).unwrap();
        assert_eq!(store.get(), Some(pair));

        store.clear().unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = temp_path("credentials.json");
        let pair = CredentialPair::new("access", Some("refresh".into()));

        {
            let store = FileCredentialStore::open(&path).unwrap();
            assert!(store.get().is_none());
            store.set(&pair).unwrap();
        }

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.get(), Some(pair));

        reopened.clear().unwrap();
        assert!(!path.exists());
        assert!(FileCredentialStore::open(&path).unwrap().get().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn file_store_ignores_corrupt_file() {
        let path = temp_path("credentials.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCredentialStore::open(&path).unwrap();
        assert!(store.get().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
