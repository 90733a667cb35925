use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistenceError;

/// Key holding the storage-tier preference. Always lives in the persistent tier.
pub const REMEMBER_ME_KEY: &str = "remember_me";
pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const VOTING_HISTORY_KEY: &str = "votingHistory";
pub const RECENT_ETFS_KEY: &str = "helios_recent_etfs";

/// Keys that follow the user when the storage tier changes.
pub const MIGRATED_KEYS: [&str; 3] = [VOTING_HISTORY_KEY, RECENT_ETFS_KEY, AUTH_TOKEN_KEY];

/// A string key/value store.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

impl<S: StorageBackend + ?Sized> StorageBackend for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        (**self).remove(key)
    }
}

/// In-memory store, optionally limited to a total number of bytes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects writes once keys and values exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let size = key.len() + value.len();
            if others + size > quota {
                return Err(PersistenceError::QuotaExceeded {
                    key: key.to_string(),
                    size,
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One `{key}.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A persistent tier and a session tier, selected by the `remember_me`
/// preference.
pub struct TieredStorage {
    persistent: Arc<dyn StorageBackend>,
    session: Arc<dyn StorageBackend>,
    remember_me: Mutex<bool>,
}

impl TieredStorage {
    pub fn new(persistent: Arc<dyn StorageBackend>, session: Arc<dyn StorageBackend>) -> Self {
        let remember_me = read_json(persistent.as_ref(), REMEMBER_ME_KEY).unwrap_or(false);
        Self {
            persistent,
            session,
            remember_me: Mutex::new(remember_me),
        }
    }

    /// Both tiers in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    pub fn remember_me(&self) -> bool {
        *self.remember_me.lock()
    }

    /// The tier reads and writes currently go to.
    pub fn active(&self) -> Arc<dyn StorageBackend> {
        if self.remember_me() {
            self.persistent.clone()
        } else {
            self.session.clone()
        }
    }

    /// Switch tiers, moving the well-known keys across.
    ///
    /// Each key is written to the new tier before it is removed from the old
    /// one, so a failure part way leaves the data readable somewhere.
    pub fn set_remember_me(&self, remember: bool) {
        let mut current = self.remember_me.lock();
        if let Err(e) = write_json(self.persistent.as_ref(), REMEMBER_ME_KEY, &remember) {
            tracing::warn!(error = %e, "failed to persist storage preference");
        }
        if *current == remember {
            return;
        }

        let (from, to) = if remember {
            (&self.session, &self.persistent)
        } else {
            (&self.persistent, &self.session)
        };
        for key in MIGRATED_KEYS {
            match from.get(key) {
                Ok(Some(value)) => {
                    if let Err(e) = to.set(key, &value) {
                        tracing::warn!(key, error = %e, "storage migration write failed, keeping old copy");
                        continue;
                    }
                    if let Err(e) = from.remove(key) {
                        tracing::warn!(key, error = %e, "storage migration cleanup failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key, error = %e, "storage migration read failed"),
            }
        }
        *current = remember;
        tracing::debug!(remember, "storage tier switched");
    }

    pub fn auth_token(&self) -> Option<String> {
        read_json(self.active().as_ref(), AUTH_TOKEN_KEY)
    }

    pub fn set_auth_token(&self, token: Option<&str>) {
        let active = self.active();
        let result = match token {
            Some(token) => write_json(active.as_ref(), AUTH_TOKEN_KEY, &token),
            None => active.remove(AUTH_TOKEN_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist auth token");
        }
    }
}

/// Read a JSON value; missing or corrupt entries read as `None`.
pub fn read_json<T: DeserializeOwned>(backend: &dyn StorageBackend, key: &str) -> Option<T> {
    let raw = match backend.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key, error = %e, "storage read failed");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding corrupt stored value");
            None
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<(), PersistenceError> {
    let raw = serde_json::to_string(value).map_err(|e| PersistenceError::Serialize {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    backend.set(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_quota() {
        let storage = MemoryStorage::with_quota(16);
        storage.set("a", "1234").unwrap();
        // Overwriting a key does not count its old value.
        storage.set("a", "12345678").unwrap();
        let err = storage.set("b", "123456789").unwrap_err();
        assert!(matches!(err, PersistenceError::QuotaExceeded { size: 10, .. }));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).unwrap();

        assert_eq!(storage.get("votingHistory").unwrap(), None);
        storage.set("votingHistory", "[1,2]").unwrap();
        assert_eq!(storage.get("votingHistory").unwrap().as_deref(), Some("[1,2]"));
        assert!(dir.path().join("nested/votingHistory.json").exists());

        storage.remove("votingHistory").unwrap();
        storage.remove("votingHistory").unwrap();
        assert_eq!(storage.get("votingHistory").unwrap(), None);
    }

    #[test]
    fn test_file_storage_sanitises_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.set("../escape", "1").unwrap();
        assert!(dir.path().join("___escape.json").exists());
    }

    #[test]
    fn test_corrupt_json_reads_as_none() {
        let storage = MemoryStorage::new();
        storage.set("k", "{not json").unwrap();
        assert_eq!(read_json::<Vec<u32>>(&storage, "k"), None);
        assert_eq!(read_json::<Vec<u32>>(&storage, "missing"), None);
    }

    #[test]
    fn test_remember_me_migrates_keys() {
        let persistent = Arc::new(MemoryStorage::new());
        let session = Arc::new(MemoryStorage::new());
        let tiers = TieredStorage::new(persistent.clone(), session.clone());
        assert!(!tiers.remember_me());

        session.set(VOTING_HISTORY_KEY, "[]").unwrap();
        tiers.set_auth_token(Some("jwt"));
        assert_eq!(session.get(AUTH_TOKEN_KEY).unwrap().as_deref(), Some("\"jwt\""));

        tiers.set_remember_me(true);
        assert!(tiers.remember_me());
        assert_eq!(persistent.get(VOTING_HISTORY_KEY).unwrap().as_deref(), Some("[]"));
        assert_eq!(session.get(VOTING_HISTORY_KEY).unwrap(), None);
        assert_eq!(tiers.auth_token().as_deref(), Some("jwt"));
        assert_eq!(session.get(AUTH_TOKEN_KEY).unwrap(), None);

        // The preference survives a restart.
        let reopened = TieredStorage::new(persistent.clone(), Arc::new(MemoryStorage::new()));
        assert!(reopened.remember_me());
    }

    #[test]
    fn test_failed_migration_keeps_old_copy() {
        let persistent = Arc::new(MemoryStorage::with_quota(40));
        let session = Arc::new(MemoryStorage::new());
        let tiers = TieredStorage::new(persistent.clone(), session.clone());

        session.set(VOTING_HISTORY_KEY, &"x".repeat(100)).unwrap();
        tiers.set_remember_me(true);

        assert_eq!(persistent.get(VOTING_HISTORY_KEY).unwrap(), None);
        assert!(session.get(VOTING_HISTORY_KEY).unwrap().is_some());
    }
}
