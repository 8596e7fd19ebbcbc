//! Extraction and removal of cache digests
//!
//! Both primitives hold the cache database lock for their whole tree
//! mutation. Removal never proceeds while the usage registry records a
//! mount for the digest.

use crate::cache::{CacheKey, CacheStore, Pruned};
use crate::error::{KcacheError, KcacheResult};
use crate::extract::image::ImageRef;
use crate::extract::unpacker::{Compatibility, UnpackRequest, Unpacker};
use crate::fsutil;
use crate::lock::RootLock;
use crate::usage::UsageRegistry;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a successful extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub compatibility: Compatibility,
    pub size: u64,
}

/// Result of a removal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Digest directory deleted, with whatever cascaded
    Removed(Pruned),
    /// Nothing was on disk for the key
    Absent,
    /// A mount still references the digest; nothing was touched
    InUse { ref_count: u32, handles: Vec<String> },
}

impl Removal {
    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::InUse { .. })
    }
}

impl fmt::Display for Removal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed(_) => write!(f, "removed"),
            Self::Absent => write!(f, "not present"),
            Self::InUse { ref_count, handles } => write!(
                f,
                "still in use by {} mount(s): {}",
                ref_count,
                handles.join(", ")
            ),
        }
    }
}

/// The extraction and removal primitives over both databases
#[derive(Clone)]
pub struct Extractor {
    store: CacheStore,
    usage: UsageRegistry,
    unpacker: Arc<dyn Unpacker>,
}

impl Extractor {
    pub fn new(store: CacheStore, usage: UsageRegistry, unpacker: Arc<dyn Unpacker>) -> Self {
        Self {
            store,
            usage,
            unpacker,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn usage(&self) -> &UsageRegistry {
        &self.usage
    }

    /// Unpack `image` pinned to `key.digest` into the database
    ///
    /// Unpacking happens in a staging directory that is renamed into place
    /// on success, so a repeated extraction replaces the previous copy.
    /// On failure or cancellation the staging directory is deleted before
    /// the error is returned.
    pub async fn extract(
        &self,
        key: &CacheKey,
        image: &str,
        device_ids: &[u32],
        cancel: &CancellationToken,
    ) -> KcacheResult<Extracted> {
        let pinned = ImageRef::parse(image)?.with_digest(&key.digest)?;
        if cancel.is_cancelled() {
            return Err(KcacheError::Cancelled(format!("extraction of {}", key)));
        }

        let lock = self.store.lock().await?;
        let staging = self.store.staging_dir(key);
        fsutil::remove_tree_if_exists(&staging).await?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| KcacheError::io(format!("creating {}", staging.display()), e))?;

        let request = UnpackRequest {
            image: pinned,
            target_dir: staging,
            device_ids: device_ids.to_vec(),
        };
        info!("Extracting {} from {}", key, request.image);

        let unpacked = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KcacheError::Cancelled(format!("extraction of {}", key))),
            result = self.unpacker.unpack(&request) => result,
        };

        let outcome = match unpacked {
            Ok(compatibility) => self.commit(&lock, key, image, compatibility).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!("Extraction of {} failed: {}", key, e);
            if let Err(cleanup) = self.store.discard_staging(&lock, key).await {
                warn!("Failed to clean up staging for {}: {}", key, cleanup);
            }
        }
        outcome
    }

    async fn commit(
        &self,
        lock: &RootLock,
        key: &CacheKey,
        image: &str,
        compatibility: Compatibility,
    ) -> KcacheResult<Extracted> {
        let size = fsutil::dir_size(&self.store.staging_dir(key)).await?;
        self.store.commit_staging(lock, key).await?;
        self.store.record_extraction(lock, key, image, size).await?;

        debug!("Extracted {} ({} bytes)", key, size);
        Ok(Extracted {
            compatibility,
            size,
        })
    }

    /// Delete `key` from the database unless a mount records it
    pub async fn remove(&self, key: &CacheKey) -> KcacheResult<Removal> {
        if let Some(in_use) = self.in_use(key).await? {
            return Ok(in_use);
        }

        let lock = self.store.lock().await?;
        // The mount server may have recorded a mount while we waited.
        if let Some(in_use) = self.in_use(key).await? {
            return Ok(in_use);
        }

        let pruned = self.store.delete_digest(&lock, key).await?;
        if pruned.digest_dir {
            info!("Removed {}", key);
            Ok(Removal::Removed(pruned))
        } else {
            Ok(Removal::Absent)
        }
    }

    async fn in_use(&self, key: &CacheKey) -> KcacheResult<Option<Removal>> {
        Ok(self
            .usage
            .get_usage(key)
            .await?
            .filter(|u| u.in_use())
            .map(|u| {
                debug!("{} is in use ({} refs)", key, u.ref_count);
                Removal::InUse {
                    ref_count: u.ref_count,
                    handles: u.mount_handles,
                }
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::tests::digest;
    use crate::cache::ScopeKey;
    use crate::extract::unpacker::StubUnpacker;
    use crate::lock::LockArbiter;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FailingUnpacker;

    #[async_trait]
    impl Unpacker for FailingUnpacker {
        async fn unpack(&self, request: &UnpackRequest) -> KcacheResult<Compatibility> {
            tokio::fs::write(request.target_dir.join("half.bin"), b"partial")
                .await
                .unwrap();
            Err(KcacheError::Extraction {
                image: request.image.to_string(),
                reason: "no kernels for this hardware".to_string(),
            })
        }
    }

    struct HangingUnpacker;

    #[async_trait]
    impl Unpacker for HangingUnpacker {
        async fn unpack(&self, request: &UnpackRequest) -> KcacheResult<Compatibility> {
            tokio::fs::write(request.target_dir.join("half.bin"), b"partial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Compatibility::default())
        }
    }

    struct Fixture {
        _cache: TempDir,
        _usage: TempDir,
        extractor: Extractor,
    }

    fn fixture(unpacker: Arc<dyn Unpacker>) -> Fixture {
        let cache = TempDir::new().unwrap();
        let usage = TempDir::new().unwrap();
        let arbiter = LockArbiter::new();
        let extractor = Extractor::new(
            CacheStore::new(cache.path(), arbiter.clone()),
            UsageRegistry::new(usage.path(), arbiter),
            unpacker,
        );
        Fixture {
            _cache: cache,
            _usage: usage,
            extractor,
        }
    }

    fn yellow(c: char) -> CacheKey {
        CacheKey::new(ScopeKey::Cluster, "yellowKernel", digest(c)).unwrap()
    }

    fn tree(root: &std::path::Path) -> Vec<String> {
        let mut out = vec![];
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let rel = entry.path().strip_prefix(root).unwrap().display().to_string();
                if rel.ends_with(".kcache.lock") {
                    continue;
                }
                if entry.file_type().unwrap().is_dir() {
                    stack.push(entry.path());
                }
                out.push(rel);
            }
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn extract_writes_metadata() {
        let fx = fixture(Arc::new(StubUnpacker));
        let key = yellow('a');

        let extracted = fx
            .extractor
            .extract(&key, "quay.io/gpu/yellow:v1", &[0, 1, 2], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(extracted.compatibility.compatible, vec![0]);
        assert_eq!(extracted.compatibility.incompatible, vec![1, 2]);
        let meta = fx
            .extractor
            .store()
            .read_metadata(&key.scope, &key.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.resolved_digest, key.digest);
        assert!(meta.size_of(&key.digest).unwrap() > 0);
        assert_eq!(meta.image, "quay.io/gpu/yellow:v1");
    }

    #[tokio::test]
    async fn extract_twice_is_idempotent() {
        let fx = fixture(Arc::new(StubUnpacker));
        let key = yellow('a');
        let cancel = CancellationToken::new();

        fx.extractor.extract(&key, "repo/y:v1", &[0], &cancel).await.unwrap();
        let meta_first = fx
            .extractor
            .store()
            .read_metadata(&key.scope, &key.name)
            .await
            .unwrap();
        let tree_first = tree(fx.extractor.store().root());

        fx.extractor.extract(&key, "repo/y:v1", &[0], &cancel).await.unwrap();

        assert_eq!(tree(fx.extractor.store().root()), tree_first);
        assert_eq!(
            fx.extractor
                .store()
                .read_metadata(&key.scope, &key.name)
                .await
                .unwrap(),
            meta_first
        );
        assert_eq!(fx.extractor.store().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_extract_leaves_no_partial_entry() {
        let fx = fixture(Arc::new(FailingUnpacker));
        let key = yellow('a');

        let err = fx
            .extractor
            .extract(&key, "repo/y:v1", &[0], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, KcacheError::Extraction { .. }));
        assert!(tree(fx.extractor.store().root()).is_empty());
    }

    #[tokio::test]
    async fn failed_extract_keeps_sibling_digests() {
        let good = fixture(Arc::new(StubUnpacker));
        let old = yellow('a');
        good.extractor
            .extract(&old, "repo/y:v1", &[0], &CancellationToken::new())
            .await
            .unwrap();

        let failing = Extractor::new(
            good.extractor.store().clone(),
            good.extractor.usage().clone(),
            Arc::new(FailingUnpacker),
        );
        let new = yellow('b');
        assert!(failing
            .extract(&new, "repo/y:v2", &[0], &CancellationToken::new())
            .await
            .is_err());

        let listed = good.extractor.store().list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, old);
    }

    #[tokio::test]
    async fn cancelled_extract_cleans_up() {
        let fx = fixture(Arc::new(HangingUnpacker));
        let key = yellow('a');
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = fx
            .extractor
            .extract(&key, "repo/y:v1", &[0], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, KcacheError::Cancelled(_)));
        assert!(tree(fx.extractor.store().root()).is_empty());
    }

    #[tokio::test]
    async fn remove_refuses_while_mounted() {
        let fx = fixture(Arc::new(StubUnpacker));
        let key = yellow('a');
        fx.extractor
            .extract(&key, "repo/y:v1", &[0], &CancellationToken::new())
            .await
            .unwrap();
        fx.extractor.usage().add_usage(&key, "vol-1", 10).await.unwrap();
        let before = tree(fx.extractor.store().root());

        let removal = fx.extractor.remove(&key).await.unwrap();

        assert_eq!(
            removal,
            Removal::InUse {
                ref_count: 1,
                handles: vec!["vol-1".to_string()]
            }
        );
        assert!(removal.to_string().contains("vol-1"));
        assert_eq!(tree(fx.extractor.store().root()), before);
    }

    #[tokio::test]
    async fn remove_after_release_cascades() {
        let fx = fixture(Arc::new(StubUnpacker));
        let key = yellow('a');
        fx.extractor
            .extract(&key, "repo/y:v1", &[0], &CancellationToken::new())
            .await
            .unwrap();
        fx.extractor.usage().add_usage(&key, "vol-1", 10).await.unwrap();
        fx.extractor.usage().delete_usage("vol-1").await.unwrap();

        let removal = fx.extractor.remove(&key).await.unwrap();

        assert_eq!(
            removal,
            Removal::Removed(Pruned {
                digest_dir: true,
                name_dir: true,
                scope_dir: true
            })
        );
        assert!(tree(fx.extractor.store().root()).is_empty());
        assert_eq!(fx.extractor.remove(&key).await.unwrap(), Removal::Absent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_extract_and_remove_serialize() {
        let fx = fixture(Arc::new(StubUnpacker));
        let key = yellow('a');

        let mut tasks = vec![];
        for i in 0..6 {
            let extractor = fx.extractor.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    extractor
                        .extract(&key, "repo/y:v1", &[0], &CancellationToken::new())
                        .await
                        .map(|_| ())
                } else {
                    extractor.remove(&key).await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Whatever the order, the tree is either fully extracted or fully gone.
        let listed = fx.extractor.store().list().await.unwrap();
        let meta = fx
            .extractor
            .store()
            .read_metadata(&key.scope, &key.name)
            .await
            .unwrap();
        match listed.len() {
            0 => assert!(meta.is_none()),
            1 => assert!(meta.unwrap().size_of(&key.digest).unwrap() > 0),
            n => panic!("unexpected {n} entries"),
        }
        let staging_left = tree(fx.extractor.store().root())
            .iter()
            .any(|p| p.contains(".partial"));
        assert!(!staging_left);
    }
}
