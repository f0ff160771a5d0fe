#![forbid(unsafe_code)]

//! Durable key-value storage holding serialized catalog state.
//!
//! Every value is an opaque string stored under a fixed key, the same shape a
//! browser's local storage offers. Two backends exist: [`FileStorage`] keeps
//! one file per key inside a data directory, [`MemoryStorage`] keeps
//! everything in process and can enforce a byte quota so tests can provoke
//! write failures.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;

/// Minimal string store shared by the episode store, the session gate and
/// the sync helpers. Implementations must be usable from several threads.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores each key as `<root>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Creates the data directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        ensure_safe_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Writes through a temporary file and renames it over the target so a
    /// reader never observes a half-written value.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, value).with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn ensure_safe_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        bail!("invalid storage key: {key:?}");
    }
    Ok(())
}

/// In-process storage. With a quota set, a write that would push the total
/// size of all keys and values past the limit fails and leaves the previous
/// value in place.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(quota) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                bail!("storage quota exceeded ({needed} of {quota} bytes) writing {key}");
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
