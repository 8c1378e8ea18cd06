//! Local state store
//!
//! A tiny persisted key/value surface holding two advisory flags. Nothing
//! here is authoritative: the reconciler always prefers a live platform
//! lookup, and an unreadable store simply reads as "flag absent".

use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Key of the "notifications enabled" flag
pub const ENABLED_KEY: &str = "notifications-enabled";

/// Key of the "prompt dismissed" flag
pub const DISMISSED_KEY: &str = "notification-prompt-dismissed";

const TRUE_VALUE: &str = "true";

/// String key/value persistence
#[cfg_attr(test, mockall::automock)]
pub trait LocalStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value; absent keys are fine
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Store persisted as a JSON object file
///
/// Every write rewrites the whole file through a sibling temp file and a
/// rename, so readers never observe a half-written object.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Store backed by `path`; the file is created on first write
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut entries = self.read_all()?;
        apply(&mut entries);
        self.write_all(&entries)
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Typed view of the two advisory flags
#[derive(Clone)]
pub struct LocalFlags {
    store: Arc<dyn LocalStore>,
}

impl std::fmt::Debug for LocalFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFlags").finish_non_exhaustive()
    }
}

impl LocalFlags {
    /// Wrap a store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// "Notifications enabled" flag
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.read(ENABLED_KEY)
    }

    /// Set or clear the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.write(ENABLED_KEY, enabled);
    }

    /// "Prompt dismissed" flag
    #[must_use]
    pub fn dismissed(&self) -> bool {
        self.read(DISMISSED_KEY)
    }

    /// Set or clear the dismissed flag
    pub fn set_dismissed(&self, dismissed: bool) {
        self.write(DISMISSED_KEY, dismissed);
    }

    /// Clear both flags
    pub fn clear(&self) {
        self.write(ENABLED_KEY, false);
        self.write(DISMISSED_KEY, false);
    }

    fn read(&self, key: &str) -> bool {
        match self.store.get(key) {
            Ok(value) => value.as_deref() == Some(TRUE_VALUE),
            Err(e) => {
                tracing::warn!(key, error = %e, "local flag unreadable, treating as absent");
                false
            }
        }
    }

    fn write(&self, key: &str, value: bool) {
        let result = if value {
            self.store.set(key, TRUE_VALUE)
        } else {
            self.store.remove(key)
        };
        if let Err(e) = result {
            tracing::warn!(key, value, error = %e, "failed to persist local flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_flags() {
        let flags = LocalFlags::new(Arc::new(MemoryStore::new()));
        assert!(!flags.enabled());
        assert!(!flags.dismissed());

        flags.set_enabled(true);
        flags.set_dismissed(true);
        assert!(flags.enabled());
        assert!(flags.dismissed());

        flags.clear();
        assert!(!flags.enabled());
        assert!(!flags.dismissed());
    }

    #[test]
    fn non_true_values_read_as_false() {
        let store = Arc::new(MemoryStore::new());
        store.set(ENABLED_KEY, "yes").unwrap();
        let flags = LocalFlags::new(store);
        assert!(!flags.enabled());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("flags.json");

        let flags = LocalFlags::new(Arc::new(FileStore::new(&path)));
        flags.set_enabled(true);

        let reopened = LocalFlags::new(Arc::new(FileStore::new(&path)));
        assert!(reopened.enabled());
        assert!(!reopened.dismissed());

        reopened.set_enabled(false);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(ENABLED_KEY));
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.get(ENABLED_KEY), Err(StoreError::Corrupt(_))));

        let flags = LocalFlags::new(Arc::new(store));
        assert!(!flags.enabled());
    }

    #[test]
    fn failing_store_never_panics() {
        let mut store = MockLocalStore::new();
        store.expect_get().returning(|_| {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "locked",
            )))
        });
        store.expect_set().returning(|_, _| {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        });

        let flags = LocalFlags::new(Arc::new(store));
        flags.set_enabled(true);
        assert!(!flags.enabled());
    }
}
