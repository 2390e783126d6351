//! Directory-backed memoization of task results.
//!
//! Results are keyed by a deterministic fingerprint of the callable's
//! qualified name and its resolved argument values, and persisted as JSON
//! files under a configurable root directory. A cache hit short-circuits the
//! callable entirely, so an unusable store fails loudly rather than silently
//! degrading to uncached execution.
//!
//! The store location is mutable shared state: changing the root affects all
//! subsequent operations on the same [`Cache`] without migrating or deleting
//! entries at the old root.

use crate::errors::{DagflowError, Result};
use crate::graph::{CallArgs, TaskValue};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Default cache directory name, created under the current working
/// directory when no explicit root is given.
pub const DEFAULT_CACHE_DIR: &str = "dagflow_cache";

/// A deterministic memoization key for one (callable, arguments) pair.
///
/// Stable across process restarts: equal task names and equal argument
/// values always produce equal fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    task: String,
    digest: String,
}

impl Fingerprint {
    /// Computes the fingerprint for a task invocation.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when an argument value cannot be
    /// serialized.
    pub fn compute(task: &str, args: &CallArgs) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(task.as_bytes());
        hasher.update(b":");
        hasher.update(serde_json::to_string(&args.positional)?.as_bytes());
        hasher.update(b":");
        hasher.update(serde_json::to_string(&args.keyword)?.as_bytes());
        let digest = hasher.finalize();

        Ok(Self {
            task: task.to_string(),
            digest: hex::encode(&digest[..16]),
        })
    }

    /// The task name component of the key.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    /// The hex digest component of the key.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn mirror_key(&self) -> String {
        format!("{}/{}", self.task, self.digest)
    }
}

/// The memoization store shared by cached tasks.
///
/// Intended to be shared via `Arc` between the runner, the engine and any
/// code that wants to manage the cache directly.
#[derive(Debug)]
pub struct Cache {
    root: RwLock<PathBuf>,
    /// In-memory mirror of entries under the current root. Flushed whenever
    /// the root changes or the store is cleared.
    mirror: DashMap<String, TaskValue>,
}

impl Cache {
    /// Creates a cache rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: RwLock::new(root.into()),
            mirror: DashMap::new(),
        }
    }

    /// Creates a cache rooted at `dagflow_cache` under the current working
    /// directory.
    #[must_use]
    pub fn with_default_root() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(cwd.join(DEFAULT_CACHE_DIR))
    }

    /// The current root directory.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.root.read().clone()
    }

    /// Points the cache at a new root directory.
    ///
    /// Starts a fresh namespace: entries under the old root are neither
    /// migrated nor deleted, and future reads and writes go to the new root
    /// only.
    pub fn set_root(&self, root: impl Into<PathBuf>) {
        *self.root.write() = root.into();
        self.mirror.clear();
    }

    /// Removes every persisted entry under the current root.
    ///
    /// When `warn` is true, problems encountered while removing entries are
    /// logged; when false they are suppressed entirely.
    pub fn clear(&self, warn: bool) {
        self.mirror.clear();
        let root = self.root();

        match fs::remove_dir_all(&root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                if warn {
                    tracing::warn!(root = %root.display(), error = %err, "failed to clear cache");
                }
            }
        }
    }

    /// Looks up a previously persisted result.
    ///
    /// # Errors
    ///
    /// Returns [`DagflowError::CacheUnavailable`] when the store exists but
    /// cannot be read, and a serialization error for a corrupt entry.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<TaskValue>> {
        if let Some(hit) = self.mirror.get(&fingerprint.mirror_key()) {
            return Ok(Some(hit.clone()));
        }

        let path = self.entry_path(fingerprint);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(DagflowError::cache_unavailable(path, err)),
        };

        let value: TaskValue = serde_json::from_slice(&raw)?;
        self.mirror.insert(fingerprint.mirror_key(), value.clone());
        Ok(Some(value))
    }

    /// Persists a computed result.
    ///
    /// Concurrent first computations of the same fingerprint may both reach
    /// this point; the last write is authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`DagflowError::CacheUnavailable`] when the store cannot be
    /// written.
    pub fn store(&self, fingerprint: &Fingerprint, value: &TaskValue) -> Result<()> {
        let path = self.entry_path(fingerprint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DagflowError::cache_unavailable(parent.to_path_buf(), err))?;
        }

        let raw = serde_json::to_vec(value)?;
        fs::write(&path, raw).map_err(|err| DagflowError::cache_unavailable(path, err))?;

        self.mirror.insert(fingerprint.mirror_key(), value.clone());
        Ok(())
    }

    /// Returns the memoized result for the fingerprint, computing and
    /// persisting it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates store failures and errors from the compute closure.
    pub fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        compute: impl FnOnce() -> Result<TaskValue>,
    ) -> Result<TaskValue> {
        if let Some(hit) = self.lookup(fingerprint)? {
            return Ok(hit);
        }

        let value = compute()?;
        self.store(fingerprint, &value)?;
        Ok(value)
    }

    /// Path of the entry file for a fingerprint under the current root.
    #[must_use]
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root()
            .join(&fingerprint.task)
            .join(format!("{}.json", fingerprint.digest))
    }

    /// Whether an entry for the fingerprint exists on disk under the
    /// current root.
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        Path::new(&self.entry_path(fingerprint)).exists()
    }
}
