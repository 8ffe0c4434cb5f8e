//! Optional persistent backing for cache entries.
//!
//! A backend stores [`PersistedEntry`] records addressed by
//! `(namespace, key)`. The namespace is the cache name, so two caches never
//! read each other's entries. Backends are consulted on a memory miss and
//! written after a successful computation; the cache treats every backend
//! failure as a miss and logs it.
//!
//! ## Disk layout
//!
//! ```text
//!   <root>/
//!   ├── load_loans/
//!   │   ├── 3f9a...e1.json
//!   │   └── 77c0...04.json
//!   └── pipeline/
//!       └── a1b2...ff.json
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader sees either the old file or the new one.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::key::CacheKey;

/// Format version written into every persisted entry.
pub const PERSIST_FORMAT: u32 = 1;

/// One persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub format: u32,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    #[serde(default)]
    pub size_hint: usize,
    pub payload: serde_json::Value,
}

impl PersistedEntry {
    pub fn new(created_at_ms: u64, size_hint: usize, payload: serde_json::Value) -> Self {
        Self {
            format: PERSIST_FORMAT,
            created_at_ms,
            size_hint,
            payload,
        }
    }
}

/// Storage outside the process for cache entries.
pub trait PersistBackend: Send + Sync + fmt::Debug {
    fn save(
        &self,
        namespace: &str,
        key: &CacheKey,
        entry: &PersistedEntry,
    ) -> Result<(), PersistError>;

    fn load(&self, namespace: &str, key: &CacheKey) -> Result<Option<PersistedEntry>, PersistError>;

    fn remove(&self, namespace: &str, key: &CacheKey) -> Result<(), PersistError>;

    /// Removes every entry in `namespace`, returning how many were removed.
    fn clear(&self, namespace: &str) -> Result<usize, PersistError>;
}

// ---------------------------------------------------------------------------
// DiskBackend
// ---------------------------------------------------------------------------

/// One JSON file per entry under a root directory.
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl DiskBackend {
    /// Opens (creating if needed) the backend rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistError::io(&root, e))?;
        Ok(Self {
            root,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(sanitize_namespace(namespace))
    }

    fn entry_path(&self, namespace: &str, key: &CacheKey) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.json", key.to_hex()))
    }
}

/// Maps a cache name onto a single safe path component.
fn sanitize_namespace(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl PersistBackend for DiskBackend {
    fn save(
        &self,
        namespace: &str,
        key: &CacheKey,
        entry: &PersistedEntry,
    ) -> Result<(), PersistError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;

        let bytes = serde_json::to_vec(entry)?;
        let path = self.entry_path(namespace, key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(
            ".{}.{}.{seq}.tmp",
            key.to_hex(),
            std::process::id()
        ));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PersistError::io(&path, e)
        })
    }

    fn load(&self, namespace: &str, key: &CacheKey) -> Result<Option<PersistedEntry>, PersistError> {
        let path = self.entry_path(namespace, key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::io(&path, e)),
        };
        let entry: PersistedEntry = serde_json::from_slice(&bytes)?;
        if entry.format != PERSIST_FORMAT {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn remove(&self, namespace: &str, key: &CacheKey) -> Result<(), PersistError> {
        let path = self.entry_path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::io(&path, e)),
        }
    }

    fn clear(&self, namespace: &str) -> Result<usize, PersistError> {
        let dir = self.namespace_dir(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PersistError::io(&dir, e)),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|e| PersistError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).map_err(|e| PersistError::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// In-process backend, mostly for tests and for sharing entries between
/// registries in one process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<FxHashMap<(String, CacheKey), PersistedEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PersistBackend for MemoryBackend {
    fn save(
        &self,
        namespace: &str,
        key: &CacheKey,
        entry: &PersistedEntry,
    ) -> Result<(), PersistError> {
        self.entries
            .lock()
            .insert((namespace.to_string(), *key), entry.clone());
        Ok(())
    }

    fn load(&self, namespace: &str, key: &CacheKey) -> Result<Option<PersistedEntry>, PersistError> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), *key))
            .cloned())
    }

    fn remove(&self, namespace: &str, key: &CacheKey) -> Result<(), PersistError> {
        self.entries.lock().remove(&(namespace.to_string(), *key));
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<usize, PersistError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(ns, _), _| ns != namespace);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 32])
    }

    fn entry(v: serde_json::Value) -> PersistedEntry {
        PersistedEntry::new(1_700_000_000_000, 3, v)
    }

    #[test]
    fn namespace_is_sanitized() {
        assert_eq!(sanitize_namespace("load_loans"), "load_loans");
        assert_eq!(sanitize_namespace("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_namespace(""), "_");
    }

    #[test]
    fn disk_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path().join("cache")).unwrap();

        assert_eq!(backend.load("ns", &key(1)).unwrap(), None);
        backend.save("ns", &key(1), &entry(json!({"rows": [1, 2]}))).unwrap();
        let loaded = backend.load("ns", &key(1)).unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"rows": [1, 2]}));
        assert_eq!(loaded.size_hint, 3);

        backend.remove("ns", &key(1)).unwrap();
        backend.remove("ns", &key(1)).unwrap();
        assert_eq!(backend.load("ns", &key(1)).unwrap(), None);
    }

    #[test]
    fn disk_overwrite_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        backend.save("ns", &key(1), &entry(json!(1))).unwrap();
        backend.save("ns", &key(1), &entry(json!(2))).unwrap();
        assert_eq!(backend.load("ns", &key(1)).unwrap().unwrap().payload, json!(2));

        let leftovers = fs::read_dir(dir.path().join("ns"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|x| x == "tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn disk_clear_is_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        backend.save("a", &key(1), &entry(json!(1))).unwrap();
        backend.save("a", &key(2), &entry(json!(2))).unwrap();
        backend.save("b", &key(1), &entry(json!(3))).unwrap();

        assert_eq!(backend.clear("a").unwrap(), 2);
        assert_eq!(backend.clear("missing").unwrap(), 0);
        assert!(backend.load("a", &key(1)).unwrap().is_none());
        assert!(backend.load("b", &key(1)).unwrap().is_some());
    }

    #[test]
    fn disk_corrupt_file_is_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        let path = backend.entry_path("ns", &key(1));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            backend.load("ns", &key(1)),
            Err(PersistError::Codec(_))
        ));
    }

    #[test]
    fn memory_backend_namespaces() {
        let backend = MemoryBackend::new();
        backend.save("a", &key(1), &entry(json!("x"))).unwrap();
        backend.save("b", &key(1), &entry(json!("y"))).unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.load("b", &key(1)).unwrap().unwrap().payload, json!("y"));
        assert_eq!(backend.clear("a").unwrap(), 1);
        backend.remove("b", &key(1)).unwrap();
        assert!(backend.is_empty());
    }
}
