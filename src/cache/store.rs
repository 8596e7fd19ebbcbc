//! On-disk cache database
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<scope>/<name>/cache.json
//! <root>/<scope>/<name>/<digest>/...        extracted bytes
//! <root>/<scope>/<name>/.<digest>.partial/  staging during extraction
//! ```
//!
//! The directory tree is the source of truth. Mutating methods take a
//! `&RootLock` so callers cannot touch the tree without holding the lock.

use crate::cache::key::{CacheKey, ScopeKey};
use crate::cache::metadata::{CacheMetadata, METADATA_FILE};
use crate::error::{KcacheError, KcacheResult};
use crate::fsutil;
use crate::lock::{LockArbiter, RootLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// One extracted digest as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCache {
    pub key: CacheKey,
    pub image: Option<String>,
    pub size: Option<u64>,
}

/// What a digest deletion removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pruned {
    pub digest_dir: bool,
    pub name_dir: bool,
    pub scope_dir: bool,
}

/// Filesystem-rooted store of extracted caches
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    arbiter: LockArbiter,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, arbiter: LockArbiter) -> Self {
        Self {
            root: root.into(),
            arbiter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire the database write lock
    pub async fn lock(&self) -> KcacheResult<RootLock> {
        self.arbiter.acquire(&self.root).await
    }

    pub fn scope_dir(&self, scope: &ScopeKey) -> PathBuf {
        self.root.join(scope.dir_name())
    }

    pub fn name_dir(&self, scope: &ScopeKey, name: &str) -> PathBuf {
        self.scope_dir(scope).join(name)
    }

    pub fn digest_dir(&self, key: &CacheKey) -> PathBuf {
        self.name_dir(&key.scope, &key.name).join(&key.digest)
    }

    pub fn metadata_path(&self, scope: &ScopeKey, name: &str) -> PathBuf {
        self.name_dir(scope, name).join(METADATA_FILE)
    }

    /// Sibling directory an extraction unpacks into before it is committed
    pub fn staging_dir(&self, key: &CacheKey) -> PathBuf {
        self.name_dir(&key.scope, &key.name)
            .join(format!(".{}.partial", key.digest))
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        fs::metadata(self.digest_dir(key))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    pub async fn read_metadata(
        &self,
        scope: &ScopeKey,
        name: &str,
    ) -> KcacheResult<Option<CacheMetadata>> {
        fsutil::read_json(&self.metadata_path(scope, name)).await
    }

    /// Recorded size of an extracted digest
    pub async fn size_of(&self, key: &CacheKey) -> KcacheResult<Option<u64>> {
        Ok(self
            .read_metadata(&key.scope, &key.name)
            .await?
            .and_then(|m| m.size_of(&key.digest)))
    }

    /// Every extracted digest on disk, with metadata where available
    pub async fn list(&self) -> KcacheResult<Vec<StoredCache>> {
        let mut found = vec![];

        for scope_dir in fsutil::list_subdirs(&self.root).await? {
            let scope = match ScopeKey::from_dir_name(&scope_dir) {
                Ok(scope) => scope,
                Err(e) => {
                    warn!("Skipping unexpected scope directory {}: {}", scope_dir, e);
                    continue;
                }
            };

            for name in fsutil::list_subdirs(&self.scope_dir(&scope)).await? {
                let metadata = match self.read_metadata(&scope, &name).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Unreadable metadata for {}/{}: {}", scope, name, e);
                        None
                    }
                };

                for digest in fsutil::list_subdirs(&self.name_dir(&scope, &name)).await? {
                    let key = match CacheKey::new(scope.clone(), name.clone(), digest.clone()) {
                        Ok(key) => key,
                        Err(e) => {
                            warn!("Skipping unexpected entry {}/{}/{}: {}", scope, name, digest, e);
                            continue;
                        }
                    };
                    found.push(StoredCache {
                        size: metadata.as_ref().and_then(|m| m.size_of(&digest)),
                        image: metadata.as_ref().map(|m| m.image.clone()),
                        key,
                    });
                }
            }
        }

        Ok(found)
    }

    /// Listing as a map of key to "seen", every value `true`
    pub async fn seen_map(&self) -> KcacheResult<BTreeMap<CacheKey, bool>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|c| (c.key, true))
            .collect())
    }

    /// Move a finished staging directory into place, replacing any previous copy
    pub async fn commit_staging(&self, _lock: &RootLock, key: &CacheKey) -> KcacheResult<()> {
        let staging = self.staging_dir(key);
        let target = self.digest_dir(key);

        if fsutil::remove_tree_if_exists(&target).await? {
            debug!("Replaced existing extraction of {}", key);
        }
        fs::rename(&staging, &target).await.map_err(|e| {
            KcacheError::io(
                format!("moving {} to {}", staging.display(), target.display()),
                e,
            )
        })
    }

    /// Drop an abandoned staging directory and any ancestors left empty by it
    pub async fn discard_staging(&self, _lock: &RootLock, key: &CacheKey) -> KcacheResult<()> {
        fsutil::remove_tree_if_exists(&self.staging_dir(key)).await?;
        if fsutil::remove_dir_if_empty(&self.name_dir(&key.scope, &key.name)).await? {
            fsutil::remove_dir_if_empty(&self.scope_dir(&key.scope)).await?;
        }
        Ok(())
    }

    /// Write the size of `key` into the name's metadata record
    pub async fn record_extraction(
        &self,
        _lock: &RootLock,
        key: &CacheKey,
        image: &str,
        size: u64,
    ) -> KcacheResult<CacheMetadata> {
        let metadata = match self.read_metadata(&key.scope, &key.name).await? {
            Some(mut existing) => {
                existing.record(image, &key.digest, size);
                existing
            }
            None => CacheMetadata::new(image, key.digest.clone(), size),
        };

        fsutil::write_json_atomic(&self.metadata_path(&key.scope, &key.name), &metadata).await?;
        Ok(metadata)
    }

    /// Delete one digest and cascade to now-empty ancestors
    ///
    /// The name directory goes away once nothing but `cache.json` is left;
    /// otherwise `cache.json` is rewritten without the removed size. The
    /// scope directory goes away once it is empty.
    pub async fn delete_digest(&self, _lock: &RootLock, key: &CacheKey) -> KcacheResult<Pruned> {
        let mut pruned = Pruned {
            digest_dir: fsutil::remove_tree_if_exists(&self.digest_dir(key)).await?,
            ..Pruned::default()
        };
        fsutil::remove_tree_if_exists(&self.staging_dir(key)).await?;

        let name_dir = self.name_dir(&key.scope, &key.name);
        let remaining: Vec<String> = fsutil::list_dir_names(&name_dir)
            .await?
            .into_iter()
            .filter(|n| n != METADATA_FILE)
            .collect();

        if remaining.is_empty() {
            pruned.name_dir = fsutil::remove_tree_if_exists(&name_dir).await?;
            pruned.scope_dir = fsutil::remove_dir_if_empty(&self.scope_dir(&key.scope)).await?;
        } else if let Some(mut metadata) = self.read_metadata(&key.scope, &key.name).await? {
            if metadata.forget(&key.digest) {
                fsutil::write_json_atomic(&self.metadata_path(&key.scope, &key.name), &metadata)
                    .await?;
            }
        }

        debug!("Deleted {} ({:?})", key, pruned);
        Ok(pruned)
    }
}
