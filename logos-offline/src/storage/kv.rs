//! Flat key → text storage.
//!
//! The Flat backend and the mutation queue only need a string map that
//! survives restarts. [`DirectoryKv`] keeps one file per key and replaces
//! files atomically (write to a temp file, then rename); [`MemoryKv`] is
//! the volatile variant used by tests and embedded callers.

use rustc_hash::FxHashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FlatError {
    #[error("I/O error on '{key}': {message}")]
    Io { key: String, message: String },

    #[error("Quota exceeded writing '{key}' ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("Flat storage lock poisoned")]
    Poisoned,
}

/// Minimal persistent string map.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, FlatError>;

    fn set(&self, key: &str, value: &str) -> Result<(), FlatError>;

    fn remove(&self, key: &str) -> Result<(), FlatError>;

    /// All keys, in no particular order.
    fn keys(&self) -> Result<Vec<String>, FlatError>;
}

// ─── In-memory ─────────────────────────────────────────────────────────

/// Volatile map with an optional byte quota.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<FxHashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push the total stored size past `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, FxHashMap<String, String>>, FlatError> {
        self.entries.lock().map_err(|_| FlatError::Poisoned)
    }

    /// Total bytes held (keys plus values).
    pub fn used_bytes(&self) -> usize {
        self.lock()
            .map(|m| m.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, FlatError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FlatError> {
        let mut entries = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            if used + needed > quota {
                return Err(FlatError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FlatError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, FlatError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

// ─── Directory-backed ──────────────────────────────────────────────────

/// One file per key under a directory.
///
/// Keys are hex-encoded into file names so any string is a valid key. Long
/// encodings are split into nested directories of [`SEGMENT_LEN`] characters
/// to stay under file-name limits (`6c6f…/…/3a63.kv`).
pub struct DirectoryKv {
    dir: PathBuf,
    /// Serializes writers within the process
    write_lock: Mutex<()>,
}

/// Hex characters per path component; well under the usual 255-byte limit.
pub const SEGMENT_LEN: usize = 128;

impl DirectoryKv {
    /// Open (creating if needed) the directory at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, FlatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir.display().to_string(), e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let encoded = hex::encode(key.as_bytes());
        let mut path = self.dir.clone();
        let mut rest = encoded.as_str();
        while rest.len() > SEGMENT_LEN {
            let (segment, tail) = rest.split_at(SEGMENT_LEN);
            path.push(segment);
            rest = tail;
        }
        path.push(format!("{rest}.kv"));
        path
    }

    fn key_from_hex(encoded: &str) -> Option<String> {
        String::from_utf8(hex::decode(encoded).ok()?).ok()
    }
}

fn io_error(key: &str, e: std::io::Error) -> FlatError {
    FlatError::Io {
        key: key.to_string(),
        message: e.to_string(),
    }
}

impl KeyValueStore for DirectoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, FlatError> {
        match fs::read_to_string(self.file_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FlatError> {
        let _guard = self.write_lock.lock().map_err(|_| FlatError::Poisoned)?;
        let target = self.file_for(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(key, e))?;
        }
        let tmp = target.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_error(key, e))?;
            file.write_all(value.as_bytes()).map_err(|e| io_error(key, e))?;
            file.sync_data().map_err(|e| io_error(key, e))?;
        }
        fs::rename(&tmp, &target).map_err(|e| io_error(key, e))
    }

    fn remove(&self, key: &str) -> Result<(), FlatError> {
        let _guard = self.write_lock.lock().map_err(|_| FlatError::Poisoned)?;
        match fs::remove_file(self.file_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, FlatError> {
        let mut keys = Vec::new();
        // (directory, hex prefix accumulated from its ancestors)
        let mut pending = vec![(self.dir.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let listing = fs::read_dir(&dir).map_err(|e| io_error("<dir>", e))?;
            for entry in listing {
                let entry = entry.map_err(|e| io_error("<dir>", e))?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let path = entry.path();
                if path.is_dir() {
                    pending.push((path, format!("{prefix}{name}")));
                } else if let Some(stem) = name.strip_suffix(".kv") {
                    match Self::key_from_hex(&format!("{prefix}{stem}")) {
                        Some(key) => keys.push(key),
                        None => log::warn!("Ignoring stray file {}", path.display()),
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(kv: &dyn KeyValueStore) {
        assert_eq!(kv.get("a").unwrap(), None);
        kv.set("a", "1").unwrap();
        kv.set("ns:cases", "[]").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));

        kv.set("a", "2").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("2"));

        let mut keys = kv.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "ns:cases".to_string()]);

        kv.remove("a").unwrap();
        kv.remove("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
    }

    #[test]
    fn test_memory_kv() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn test_directory_kv() {
        let dir = tempdir().unwrap();
        let kv = DirectoryKv::open(dir.path().join("flat")).unwrap();
        exercise(&kv);
    }

    #[test]
    fn test_directory_kv_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat");
        {
            let kv = DirectoryKv::open(&path).unwrap();
            kv.set("logos:mutation_queue", "[{\"id\":1}]").unwrap();
        }
        let kv = DirectoryKv::open(&path).unwrap();
        assert_eq!(
            kv.get("logos:mutation_queue").unwrap().as_deref(),
            Some("[{\"id\":1}]")
        );
    }

    #[test]
    fn test_directory_kv_long_keys() {
        let dir = tempdir().unwrap();
        let kv = DirectoryKv::open(dir.path()).unwrap();
        let long = format!("logos:__blob:matters/2024/{}", "exhibit-".repeat(40));
        assert!(long.len() > 300);

        kv.set(&long, "payload").unwrap();
        kv.set("short", "x").unwrap();
        assert_eq!(kv.get(&long).unwrap().as_deref(), Some("payload"));

        // Split across nested directories, every component within limits
        let file = kv.file_for(&long);
        assert!(file.components().count() > dir.path().components().count() + 1);
        assert!(file
            .strip_prefix(dir.path())
            .unwrap()
            .components()
            .all(|c| c.as_os_str().len() <= SEGMENT_LEN + 3));

        let mut keys = kv.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![long.clone(), "short".to_string()]);

        kv.remove(&long).unwrap();
        assert_eq!(kv.get(&long).unwrap(), None);
        assert_eq!(kv.keys().unwrap(), vec!["short".to_string()]);
    }

    #[test]
    fn test_directory_kv_ignores_stray_files() {
        let dir = tempdir().unwrap();
        let kv = DirectoryKv::open(dir.path()).unwrap();
        kv.set("a", "1").unwrap();
        fs::write(dir.path().join("not-hex.kv"), "junk").unwrap();
        fs::write(dir.path().join("61.tmp"), "partial").unwrap();
        assert_eq!(kv.keys().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_memory_kv_quota() {
        let kv = MemoryKv::with_quota(16);
        kv.set("k", "0123456789").unwrap();
        // Replacing the same key only counts the new value
        kv.set("k", "9876543210").unwrap();
        let err = kv.set("other", "0123456789").unwrap_err();
        assert!(matches!(err, FlatError::QuotaExceeded { .. }));
        assert_eq!(kv.used_bytes(), 11);
    }
}
