//! Object storage for frames and intermediate snapshots.

use crate::types::{CalError, CalResult, StepType};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Minimal key/value interface the engine needs from a frame store
pub trait FrameStore: Send + Sync {
    fn get(&self, key: &str) -> CalResult<Vec<u8>>;
    fn put(&self, key: &str, bytes: &[u8]) -> CalResult<()>;
    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> CalResult<Vec<String>>;
    fn delete(&self, key: &str) -> CalResult<()>;
}

/// Key for the snapshot written after step `index`
pub fn intermediate_key(storage_prefix: &str, step_type: StepType, index: usize, algorithm_id: &str) -> String {
    format!(
        "{}/{}/{:02}-{}.fits",
        storage_prefix.trim_end_matches('/'),
        step_type.as_str(),
        index,
        algorithm_id
    )
}

const KEY_PATTERN: &str = r"^[A-Za-z0-9_.\-]+(/[A-Za-z0-9_.\-]+)*$";

static KEY_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn key_regex() -> CalResult<&'static Regex> {
    KEY_RE
        .get_or_init(|| Regex::new(KEY_PATTERN))
        .as_ref()
        .map_err(|e| CalError::InvalidConfig(format!("storage key pattern: {}", e)))
}

/// Relative, slash-separated keys without `.` or `..` segments
pub fn validate_key(key: &str) -> CalResult<()> {
    let well_formed = key_regex()?.is_match(key);
    let bad_segment = key.split('/').any(|s| s == "." || s == "..");
    if !well_formed || bad_segment {
        return Err(CalError::StorageUnavailable(format!("invalid storage key '{}'", key)));
    }
    Ok(())
}

/// In-process store, mainly for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl FrameStore for MemoryStore {
    fn get(&self, key: &str) -> CalResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CalError::StorageNotFound(key.to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CalResult<()> {
        validate_key(key)?;
        self.objects.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> CalResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, key: &str) -> CalResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| CalError::StorageNotFound(key.to_string()))
    }
}

/// Store rooted at a local directory; keys map to relative paths
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> CalResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            CalError::StorageUnavailable(format!("cannot create {}: {}", root.display(), e))
        })?;
        log::debug!("Local frame store at {}", root.display());
        Ok(Self { root })
    }

    /// Store under the platform data directory
    pub fn default_location() -> CalResult<Self> {
        let base = dirs::data_local_dir()
            .ok_or_else(|| CalError::StorageUnavailable("no local data directory".to_string()))?;
        Self::new(base.join("astrocal"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> CalResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect(&self, dir: &Path, keys: &mut Vec<String>) -> CalResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CalError::StorageUnavailable(e.to_string())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CalError::StorageUnavailable(e.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, keys)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.contains(".tmp") {
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl FrameStore for LocalStore {
    fn get(&self, key: &str) -> CalResult<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CalError::StorageNotFound(key.to_string()),
            _ => CalError::StorageUnavailable(format!("{}: {}", path.display(), e)),
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CalResult<()> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| CalError::StorageUnavailable(format!("invalid storage key '{}'", key)))?;
        std::fs::create_dir_all(dir).map_err(|e| CalError::StorageUnavailable(e.to_string()))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| CalError::StorageUnavailable(e.to_string()))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.flush())
            .map_err(|e| CalError::StorageUnavailable(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| CalError::StorageUnavailable(format!("{}: {}", path.display(), e.error)))?;
        log::debug!("Stored {} bytes at {}", bytes.len(), key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> CalResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> CalResult<()> {
        let path = self.path_for(key)?;
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CalError::StorageNotFound(key.to_string()),
            _ => CalError::StorageUnavailable(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intermediate_key_layout() {
        let key = intermediate_key("production/2024-01-02/prod-x", StepType::DarkSubtraction, 1, "scaled-dark");
        assert_eq!(key, "production/2024-01-02/prod-x/dark-subtraction/01-scaled-dark.fits");
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("a/b/c.fits").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_key_pattern_compiles_once() {
        let first = key_regex().unwrap() as *const Regex;
        assert!(validate_key("night/frame.fits").is_ok());
        assert_eq!(key_regex().unwrap() as *const Regex, first);
    }

    #[test]
    fn test_memory_store_prefix_listing() {
        let store = MemoryStore::new();
        store.put("a/1", b"x").unwrap();
        store.put("a/2", b"y").unwrap();
        store.put("b/1", b"z").unwrap();
        assert_eq!(store.list("a/").unwrap(), vec!["a/1".to_string(), "a/2".to_string()]);
        store.delete("a/1").unwrap();
        assert!(matches!(store.get("a/1"), Err(CalError::StorageNotFound(_))));
    }

    #[test]
    fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("x/y/frame.fits", b"data").unwrap();
        assert_eq!(store.get("x/y/frame.fits").unwrap(), b"data");
        assert_eq!(store.list("x/").unwrap(), vec!["x/y/frame.fits".to_string()]);
        store.delete("x/y/frame.fits").unwrap();
        assert!(matches!(store.get("x/y/frame.fits"), Err(CalError::StorageNotFound(_))));
    }
}
