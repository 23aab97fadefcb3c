//! Content-addressed cache of resolved dependency locks.
//!
//! Layout: `<root>/<suite>/<index>-<sha256>.lock`, where the digest covers the suite name, variant index and
//! manifest text. Changing the manifest changes the key, so stale entries become unreachable and are only ever
//! removed by [`DependencyCache::clean`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};

/// Cache key for one variant's resolved lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    suite: String,
    index: usize,
    digest: String,
}

impl CacheKey {
    pub fn new(suite: &str, index: usize, manifest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(suite.as_bytes());
        hasher.update([0]);
        hasher.update(index.to_le_bytes());
        hasher.update([0]);
        hasher.update(manifest.as_bytes());
        Self {
            suite: suite.to_string(),
            index,
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn file_name(&self) -> String {
        format!("{}-{}.lock", self.index, self.digest)
    }
}

/// Host-local store of resolved lock files.
#[derive(Debug, Clone)]
pub struct DependencyCache {
    root: PathBuf,
}

impl DependencyCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.suite).join(key.file_name())
    }

    /// Load the cached lock for `key`.
    ///
    /// Unreadable or empty entries are treated as corruption: the entry is removed and the call reports a miss.
    pub fn try_load(&self, key: &CacheKey) -> Option<String> {
        let path = self.entry_path(key);
        match fs::read_to_string(&path) {
            Ok(lock) if !lock.trim().is_empty() => {
                tracing::debug!(path = %path.display(), "lock cache hit");
                Some(lock)
            }
            Ok(_) => {
                tracing::warn!(path = %path.display(), "empty cached lock, discarding");
                self.discard(key);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "lock cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cached lock, discarding");
                self.discard(key);
                None
            }
        }
    }

    /// Store `lock` under `key`. The entry appears atomically: readers see the old state or the full lock.
    pub fn store(&self, key: &CacheKey, lock: &str) -> io::Result<()> {
        let path = self.entry_path(key);
        let dir = self.root.join(&key.suite);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".{}.{}.tmp", key.file_name(), std::process::id()));
        fs::write(&tmp, lock)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), "stored resolved lock");
        Ok(())
    }

    /// Remove the entry for `key`, if present.
    pub fn clear(&self, key: &CacheKey) -> io::Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.clear(key) {
            tracing::warn!(error = %e, "failed to remove cached lock");
        }
    }

    /// Manual cleanup: remove every cached lock, or only those of `suite`. Returns the number of entries removed.
    pub fn clean(&self, suite: Option<&str>) -> io::Result<usize> {
        let dirs: Vec<PathBuf> = match suite {
            Some(suite) => vec![self.root.join(suite)],
            None => match fs::read_dir(&self.root) {
                Ok(entries) => entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e),
            },
        };

        let mut removed = 0;
        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "lock") {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Host-wide exclusive lock serializing dependency resolution for one runtime.
///
/// Backed by `flock`, so it excludes other threads of this process (each acquisition opens its own descriptor)
/// as well as unrelated runs on the same host. Released on drop.
#[derive(Debug)]
pub struct ResolutionLock {
    file: File,
    path: PathBuf,
}

impl ResolutionLock {
    /// Block until the lock at `path` is held.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        tracing::debug!(path = %path.display(), "resolution lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ResolutionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release resolution lock");
        }
    }
}
