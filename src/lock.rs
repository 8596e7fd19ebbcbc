//! Coarse per-root locking for the on-disk stores
//!
//! A `LockArbiter` hands out one async mutex per database root, so tasks in
//! this process queue up behind each other. The returned guard also holds an
//! exclusive advisory lock on `<root>/.kcache.lock`, which serializes this
//! process against the mount server working on the same tree.

use crate::error::{KcacheError, KcacheResult};
use fs4::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Name of the advisory lock file kept at each root
pub const LOCK_FILE: &str = ".kcache.lock";

/// Hands out root locks, keyed by canonical root path
#[derive(Debug, Clone, Default)]
pub struct LockArbiter {
    roots: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl LockArbiter {
    /// Create an arbiter with no shared state
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide arbiter used by the binary
    pub fn global() -> Self {
        static GLOBAL: OnceLock<LockArbiter> = OnceLock::new();
        GLOBAL.get_or_init(LockArbiter::new).clone()
    }

    /// Acquire the write lock for `root`, creating the root if needed
    pub async fn acquire(&self, root: &Path) -> KcacheResult<RootLock> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| KcacheError::io(format!("creating root {}", root.display()), e))?;
        let canonical = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| KcacheError::io(format!("resolving root {}", root.display()), e))?;

        let mutex = {
            let mut roots = self
                .roots
                .lock()
                .map_err(|_| KcacheError::Internal("lock arbiter poisoned".to_string()))?;
            roots.entry(canonical.clone()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;

        let lock_path = canonical.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| KcacheError::Internal(format!("lock task failed: {e}")))?
        .map_err(|e| KcacheError::io(format!("locking {}", canonical.display()), e))?;

        trace!("Acquired root lock {}", canonical.display());
        Ok(RootLock {
            root: canonical,
            _guard: guard,
            file,
        })
    }
}

/// Held for the duration of a multi-step tree mutation
#[derive(Debug)]
pub struct RootLock {
    root: PathBuf,
    _guard: OwnedMutexGuard<()>,
    file: File,
}

impl RootLock {
    /// Canonical root this lock covers
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        // Release the file lock before the in-process mutex
        let _ = self.file.unlock();
    }
}
