//! Anonymous identity resolution.
//!
//! The resolver hands out one stable anonymous id per device. The id is a
//! random UUID v4 created on first access and persisted under [`ANON_ID_KEY`]
//! in a [`KeyValueStore`]. Storage problems never reach the caller: the
//! resolver falls back to an id that lives only as long as the process.

use crate::errors::StorageError;
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// Storage key for the anonymous id.
pub const ANON_ID_KEY: &str = "anon_id";

/// Device-local key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// A JSON object on disk, one string value per key.
///
/// Writes hold an exclusive lock on a sidecar `.lock` file and replace the
/// data file through a rename, so readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<data_local_dir>/beacon/storage.json`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("beacon").join("storage.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(entries).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    /// Run a read-modify-write under the exclusive file lock.
    fn update<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| self.io_err(e))?;
        lock_file.lock_exclusive().map_err(|source| StorageError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let result = self.read_entries().and_then(|mut entries| {
            f(&mut entries);
            self.write_entries(&entries)
        });

        let _ = FileExt::unlock(&lock_file);
        result
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Where the current anonymous id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Read back from storage.
    Stored,
    /// Generated on this run and persisted.
    Created,
    /// Generated on this run; storage was unusable, so it dies with the process.
    Ephemeral,
}

impl std::fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentitySource::Stored => write!(f, "stored"),
            IdentitySource::Created => write!(f, "created"),
            IdentitySource::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Resolves the anonymous id and tracks the authenticated user, if any.
pub struct IdentityResolver {
    store: Arc<dyn KeyValueStore>,
    anonymous: Mutex<Option<(String, IdentitySource)>>,
    user_id: RwLock<Option<String>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            anonymous: Mutex::new(None),
            user_id: RwLock::new(None),
        }
    }

    /// The stable anonymous id, creating and persisting it on first use.
    ///
    /// Storage is touched at most once per resolver; later calls are served
    /// from memory.
    pub fn anonymous_id(&self) -> String {
        let mut slot = self.anonymous.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, _)) = slot.as_ref() {
            return id.clone();
        }

        let resolved = match self.store.get(ANON_ID_KEY) {
            Ok(Some(id)) if !id.trim().is_empty() => (id, IdentitySource::Stored),
            Ok(_) => {
                let id = Uuid::new_v4().to_string();
                match self.store.set(ANON_ID_KEY, &id) {
                    Ok(()) => (id, IdentitySource::Created),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "could not persist anonymous id, using ephemeral id"
                        );
                        (id, IdentitySource::Ephemeral)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read anonymous id, using ephemeral id");
                (Uuid::new_v4().to_string(), IdentitySource::Ephemeral)
            }
        };

        let id = resolved.0.clone();
        *slot = Some(resolved);
        id
    }

    /// Origin of the anonymous id; resolves it first if needed.
    pub fn source(&self) -> IdentitySource {
        self.anonymous_id();
        self.anonymous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, source)| *source)
            .unwrap_or(IdentitySource::Ephemeral)
    }

    /// Attach an authenticated user id; it becomes the subject id.
    pub fn identify(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let mut slot = self.user_id.write().unwrap_or_else(PoisonError::into_inner);
        *slot = if user_id.trim().is_empty() {
            None
        } else {
            Some(user_id)
        };
    }

    /// Forget the authenticated user. The anonymous id is kept.
    pub fn reset_user(&self) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Authenticated id if known, otherwise the anonymous id.
    pub fn subject_id(&self) -> String {
        self.user_id().unwrap_or_else(|| self.anonymous_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Memory store that counts reads and writes.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        gets: AtomicUsize,
        sets: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    /// Store whose reads and/or writes always fail.
    struct BrokenStore {
        fail_reads: bool,
        sets: AtomicUsize,
    }

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            if self.fail_reads {
                Err(StorageError::Poisoned)
            } else {
                Ok(None)
            }
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io {
                path: PathBuf::from("/read-only/storage.json"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }

        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn test_anonymous_id_is_idempotent_and_written_once() {
        let store = Arc::new(CountingStore::default());
        let resolver = IdentityResolver::new(store.clone());

        let first = resolver.anonymous_id();
        let second = resolver.anonymous_id();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok(), "id must be a UUID: {first}");
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.source(), IdentitySource::Created);
    }

    #[test]
    fn test_existing_id_is_reused_without_writing() {
        let store = Arc::new(CountingStore::default());
        store.inner.set(ANON_ID_KEY, "existing-id").unwrap();
        let resolver = IdentityResolver::new(store.clone());

        assert_eq!(resolver.anonymous_id(), "existing-id");
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.source(), IdentitySource::Stored);
    }

    #[test]
    fn test_blank_stored_id_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        store.set(ANON_ID_KEY, "  ").unwrap();
        let resolver = IdentityResolver::new(store.clone());

        let id = resolver.anonymous_id();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.get(ANON_ID_KEY).unwrap(), Some(id));
    }

    #[test]
    fn test_write_failure_falls_back_to_ephemeral_id() {
        let store = Arc::new(BrokenStore {
            fail_reads: false,
            sets: AtomicUsize::new(0),
        });
        let resolver = IdentityResolver::new(store.clone());

        let first = resolver.anonymous_id();
        let second = resolver.anonymous_id();
        assert_eq!(first, second, "ephemeral id must be stable for the process");
        assert_eq!(resolver.source(), IdentitySource::Ephemeral);
        assert_eq!(store.sets.load(Ordering::SeqCst), 1, "no retry on every call");
    }

    #[test]
    fn test_read_failure_never_writes() {
        let store = Arc::new(BrokenStore {
            fail_reads: true,
            sets: AtomicUsize::new(0),
        });
        let resolver = IdentityResolver::new(store.clone());

        let id = resolver.anonymous_id();
        assert!(!id.is_empty());
        assert_eq!(resolver.source(), IdentitySource::Ephemeral);
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_id() {
        let store = Arc::new(CountingStore::default());
        let resolver = Arc::new(IdentityResolver::new(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || resolver.anonymous_id())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subject_id_prefers_authenticated_user() {
        let resolver = IdentityResolver::new(Arc::new(MemoryStore::new()));
        let anon = resolver.anonymous_id();
        assert_eq!(resolver.subject_id(), anon);

        resolver.identify("user-7");
        assert_eq!(resolver.subject_id(), "user-7");
        assert_eq!(resolver.user_id().as_deref(), Some("user-7"));

        resolver.reset_user();
        assert_eq!(resolver.subject_id(), anon, "anonymous id survives logout");
    }

    #[test]
    fn test_identify_blank_clears_user() {
        let resolver = IdentityResolver::new(Arc::new(MemoryStore::new()));
        resolver.identify("user-7");
        resolver.identify("");
        assert!(resolver.user_id().is_none());
    }

    #[test]
    fn test_file_store_persists_across_resolvers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let first = IdentityResolver::new(Arc::new(FileStore::new(&path))).anonymous_id();
        assert!(path.exists(), "storage file must be created");

        let second_resolver = IdentityResolver::new(Arc::new(FileStore::new(&path)));
        assert_eq!(second_resolver.anonymous_id(), first);
        assert_eq!(second_resolver.source(), IdentitySource::Stored);
    }

    #[test]
    fn test_file_store_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("storage.json"));
        store.set("theme", "dark").unwrap();
        store.set(ANON_ID_KEY, "abc").unwrap();
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));

        store.remove("theme").unwrap();
        assert!(store.get("theme").unwrap().is_none());
        assert_eq!(store.get(ANON_ID_KEY).unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_corrupt_file_is_reported_and_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.get(ANON_ID_KEY), Err(StorageError::Corrupt { .. })));

        let resolver = IdentityResolver::new(Arc::new(store));
        resolver.anonymous_id();
        assert_eq!(resolver.source(), IdentitySource::Ephemeral);
        assert_eq!(fs::read_to_string(&path).unwrap(), "not json");
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("absent.json"));
        assert!(store.get(ANON_ID_KEY).unwrap().is_none());
    }
}
