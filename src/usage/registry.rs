//! Filesystem-rooted usage registry
//!
//! Written by the mount server, read by the reconciler. Layout:
//! `<root>/<scope>/<name>/<digest>/usage.json`. Absence of a record means
//! the digest is not mounted; it is never an error.

use crate::cache::{CacheKey, ScopeKey};
use crate::error::{KcacheError, KcacheResult};
use crate::fsutil;
use crate::lock::LockArbiter;
use crate::usage::entry::{UsageEntry, USAGE_FILE};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reference-counted record of which mounts use which cache
#[derive(Debug, Clone)]
pub struct UsageRegistry {
    root: PathBuf,
    arbiter: LockArbiter,
}

impl UsageRegistry {
    pub fn new(root: impl Into<PathBuf>, arbiter: LockArbiter) -> Self {
        Self {
            root: root.into(),
            arbiter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn digest_dir(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.scope.dir_name())
            .join(&key.name)
            .join(&key.digest)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.digest_dir(key).join(USAGE_FILE)
    }

    /// Record that `handle` mounts `key`
    pub async fn add_usage(
        &self,
        key: &CacheKey,
        handle: &str,
        size: u64,
    ) -> KcacheResult<UsageEntry> {
        validate_handle(handle)?;
        let _lock = self.arbiter.acquire(&self.root).await?;

        let path = self.entry_path(key);
        let mut entry = fsutil::read_json::<UsageEntry>(&path)
            .await?
            .unwrap_or_else(|| UsageEntry::new(key, size));

        if entry.acquire(handle) {
            entry.volume_size = size;
            fsutil::write_json_atomic(&path, &entry).await?;
            info!("Mount {} now uses {} (refs: {})", handle, key, entry.ref_count);
        } else {
            debug!("Mount {} already recorded for {}", handle, key);
        }
        Ok(entry)
    }

    /// Release `handle` wherever it is recorded
    ///
    /// Returns the entry as it stands after the release, or `None` if the
    /// handle was unknown. The record and its now-empty ancestors are
    /// deleted when the last handle goes.
    pub async fn delete_usage(&self, handle: &str) -> KcacheResult<Option<UsageEntry>> {
        validate_handle(handle)?;
        let _lock = self.arbiter.acquire(&self.root).await?;

        let Some((key, mut entry)) = self.find_by_handle(handle).await? else {
            debug!("Mount {} has no usage record", handle);
            return Ok(None);
        };

        entry.release(handle);
        let path = self.entry_path(&key);
        if entry.in_use() {
            fsutil::write_json_atomic(&path, &entry).await?;
        } else {
            fsutil::remove_file_if_exists(&path).await?;
            self.prune_ancestors(&key).await?;
        }

        info!("Mount {} released {} (refs: {})", handle, key, entry.ref_count);
        Ok(Some(entry))
    }

    /// Usage of one extracted digest
    pub async fn get_usage(&self, key: &CacheKey) -> KcacheResult<Option<UsageEntry>> {
        fsutil::read_json(&self.entry_path(key)).await
    }

    /// Usage record holding `handle`, with the key it belongs to
    pub async fn get_usage_by_mount_handle(
        &self,
        handle: &str,
    ) -> KcacheResult<Option<(CacheKey, UsageEntry)>> {
        validate_handle(handle)?;
        self.find_by_handle(handle).await
    }

    /// Every usage record in the registry
    pub async fn list(&self) -> KcacheResult<Vec<(CacheKey, UsageEntry)>> {
        let mut found = vec![];

        for scope_dir in fsutil::list_subdirs(&self.root).await? {
            let Ok(scope) = ScopeKey::from_dir_name(&scope_dir) else {
                warn!("Skipping unexpected usage scope directory {}", scope_dir);
                continue;
            };
            let scope_path = self.root.join(&scope_dir);

            for name in fsutil::list_subdirs(&scope_path).await? {
                for digest in fsutil::list_subdirs(&scope_path.join(&name)).await? {
                    let Ok(key) = CacheKey::new(scope.clone(), name.clone(), digest.clone()) else {
                        warn!("Skipping unexpected usage entry {}/{}/{}", scope, name, digest);
                        continue;
                    };
                    match fsutil::read_json::<UsageEntry>(&self.entry_path(&key)).await {
                        Ok(Some(entry)) => found.push((key, entry)),
                        Ok(None) => {}
                        Err(e) => warn!("Unreadable usage record for {}: {}", key, e),
                    }
                }
            }
        }

        Ok(found)
    }

    async fn find_by_handle(&self, handle: &str) -> KcacheResult<Option<(CacheKey, UsageEntry)>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|(_, entry)| entry.holds(handle)))
    }

    async fn prune_ancestors(&self, key: &CacheKey) -> KcacheResult<()> {
        let digest_dir = self.digest_dir(key);
        let Some(name_dir) = digest_dir.parent().map(Path::to_path_buf) else {
            return Ok(());
        };
        let Some(scope_dir) = name_dir.parent().map(Path::to_path_buf) else {
            return Ok(());
        };

        if fsutil::remove_dir_if_empty(&digest_dir).await?
            && fsutil::remove_dir_if_empty(&name_dir).await?
        {
            fsutil::remove_dir_if_empty(&scope_dir).await?;
        }
        Ok(())
    }
}

fn validate_handle(handle: &str) -> KcacheResult<()> {
    if handle.trim().is_empty() {
        return Err(KcacheError::InvalidKey("mount handle is empty".to_string()));
    }
    Ok(())
}
