//! File-backed cluster state
//!
//! Stands in for the API server on single-node setups and in tests:
//!
//! ```text
//! <root>/declarations/<scope>/<name>.json
//! <root>/statuses/<scope>/<node>.json
//! ```
//!
//! Writes are serialized by the root lock; status updates carry optimistic
//! concurrency through `resourceVersion`.

use crate::cache::key::{validate_digest, validate_name};
use crate::cache::{ScopeKey, ScopeKind};
use crate::cluster::api::ScopeApi;
use crate::cluster::declaration::CacheDeclaration;
use crate::cluster::status::{NodeStatusRecord, HOST_LABEL};
use crate::error::{KcacheError, KcacheResult};
use crate::extract::ImageRef;
use crate::fsutil;
use crate::lock::LockArbiter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DECLARATIONS_DIR: &str = "declarations";
const STATUSES_DIR: &str = "statuses";

/// Directory of JSON objects acting as the cluster-state store
#[derive(Debug, Clone)]
pub struct FileClusterState {
    root: PathBuf,
    arbiter: LockArbiter,
}

impl FileClusterState {
    pub fn new(root: impl Into<PathBuf>, arbiter: LockArbiter) -> Self {
        Self {
            root: root.into(),
            arbiter,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// API view limited to one scope kind
    pub fn scoped(self: &Arc<Self>, kind: ScopeKind) -> ScopedState {
        ScopedState {
            state: Arc::clone(self),
            kind,
        }
    }

    fn declaration_path(&self, scope: &ScopeKey, name: &str) -> PathBuf {
        self.root
            .join(DECLARATIONS_DIR)
            .join(scope.dir_name())
            .join(format!("{name}.json"))
    }

    fn status_path(&self, scope: &ScopeKey, node: &str) -> PathBuf {
        self.root
            .join(STATUSES_DIR)
            .join(scope.dir_name())
            .join(format!("{node}.json"))
    }

    /// Scopes with a directory under `section`, filtered by kind
    async fn scopes(&self, section: &str, kind: Option<ScopeKind>) -> KcacheResult<Vec<ScopeKey>> {
        let mut scopes = vec![];
        for dir in fsutil::list_subdirs(&self.root.join(section)).await? {
            match ScopeKey::from_dir_name(&dir) {
                Ok(scope) if kind.is_none_or(|k| scope.kind() == k) => scopes.push(scope),
                Ok(_) => {}
                Err(e) => warn!("Skipping unexpected scope directory {}: {}", dir, e),
            }
        }
        Ok(scopes)
    }

    /// JSON objects directly below `dir`
    async fn read_objects<T: serde::de::DeserializeOwned>(
        &self,
        dir: &Path,
    ) -> KcacheResult<Vec<T>> {
        let mut objects = vec![];
        for file in fsutil::list_dir_names(dir).await? {
            if !file.ends_with(".json") {
                continue;
            }
            if let Some(object) = fsutil::read_json(&dir.join(&file)).await? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    pub async fn list_declarations_of(
        &self,
        kind: Option<ScopeKind>,
    ) -> KcacheResult<Vec<CacheDeclaration>> {
        let mut declarations = vec![];
        for scope in self.scopes(DECLARATIONS_DIR, kind).await? {
            let dir = self.root.join(DECLARATIONS_DIR).join(scope.dir_name());
            declarations.extend(self.read_objects::<CacheDeclaration>(&dir).await?);
        }
        Ok(declarations)
    }

    pub async fn get_declaration(
        &self,
        scope: &ScopeKey,
        name: &str,
    ) -> KcacheResult<Option<CacheDeclaration>> {
        fsutil::read_json(&self.declaration_path(scope, name)).await
    }

    /// Create or update a declaration
    ///
    /// Changing the image without supplying a digest clears the admitted
    /// digest, as admission has to run again.
    pub async fn apply_declaration(
        &self,
        mut declaration: CacheDeclaration,
    ) -> KcacheResult<CacheDeclaration> {
        let scope = declaration.scope()?;
        validate_name(&declaration.name)?;
        ImageRef::parse(&declaration.image)?;
        if let Some(digest) = &declaration.resolved_digest {
            validate_digest(digest)?;
        }

        let _lock = self.arbiter.acquire(&self.root).await?;
        let path = self.declaration_path(&scope, &declaration.name);

        if let Some(existing) = fsutil::read_json::<CacheDeclaration>(&path).await? {
            if existing.deletion_requested {
                return Err(KcacheError::User(format!(
                    "declaration {}/{} is being deleted",
                    scope, declaration.name
                )));
            }
            if existing.image != declaration.image && declaration.resolved_digest.is_none() {
                debug!("Image of {} changed, awaiting admission", declaration.name);
            } else if declaration.resolved_digest.is_none() {
                declaration.resolved_digest = existing.resolved_digest;
            }
        }

        fsutil::write_json_atomic(&path, &declaration).await?;
        info!("Applied declaration {}/{}", scope, declaration.name);
        Ok(declaration)
    }

    /// Set the deletion-intent flag
    pub async fn request_deletion(
        &self,
        scope: &ScopeKey,
        name: &str,
    ) -> KcacheResult<CacheDeclaration> {
        let _lock = self.arbiter.acquire(&self.root).await?;
        let path = self.declaration_path(scope, name);
        let mut declaration = fsutil::read_json::<CacheDeclaration>(&path)
            .await?
            .ok_or_else(|| KcacheError::NotFound(format!("declaration {scope}/{name}")))?;

        if !declaration.deletion_requested {
            declaration.deletion_requested = true;
            fsutil::write_json_atomic(&path, &declaration).await?;
            info!("Requested deletion of {}/{}", scope, name);
        }
        Ok(declaration)
    }

    /// Delete soft-deleted declarations no status record holds a finalizer for
    pub async fn prune_deleted(&self) -> KcacheResult<Vec<CacheDeclaration>> {
        let _lock = self.arbiter.acquire(&self.root).await?;
        let mut pruned = vec![];

        for declaration in self.list_declarations_of(None).await? {
            if !declaration.deletion_requested {
                continue;
            }
            let scope = declaration.scope()?;
            let dir = self.root.join(STATUSES_DIR).join(scope.dir_name());
            let records = self.read_objects::<NodeStatusRecord>(&dir).await?;
            if records.iter().any(|r| r.has_finalizer(&declaration.name)) {
                debug!("{}/{} still held by a finalizer", scope, declaration.name);
                continue;
            }

            fsutil::remove_file_if_exists(&self.declaration_path(&scope, &declaration.name)).await?;
            info!("Pruned declaration {}/{}", scope, declaration.name);
            pruned.push(declaration);
        }
        Ok(pruned)
    }

    pub async fn get_status(
        &self,
        scope: &ScopeKey,
        node: &str,
    ) -> KcacheResult<Option<NodeStatusRecord>> {
        fsutil::read_json(&self.status_path(scope, node)).await
    }

    pub async fn list_status_of(
        &self,
        kind: Option<ScopeKind>,
        node: Option<&str>,
    ) -> KcacheResult<Vec<NodeStatusRecord>> {
        let mut records = vec![];
        for scope in self.scopes(STATUSES_DIR, kind).await? {
            let dir = self.root.join(STATUSES_DIR).join(scope.dir_name());
            records.extend(
                self.read_objects::<NodeStatusRecord>(&dir)
                    .await?
                    .into_iter()
                    .filter(|r| {
                        node.is_none_or(|n| {
                            r.metadata.labels.get(HOST_LABEL).map(String::as_str) == Some(n)
                        })
                    }),
            );
        }
        Ok(records)
    }

    pub async fn create_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord> {
        let scope = record.scope()?;
        let _lock = self.arbiter.acquire(&self.root).await?;
        let path = self.status_path(&scope, record.node());

        if fsutil::read_json::<NodeStatusRecord>(&path).await?.is_some() {
            return Err(KcacheError::AlreadyExists(format!(
                "status record {}/{}",
                scope,
                record.node()
            )));
        }

        let mut created = record.clone();
        created.status = None;
        created.metadata.resource_version = 1;
        fsutil::write_json_atomic(&path, &created).await?;
        Ok(created)
    }

    pub async fn update_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord> {
        let scope = record.scope()?;
        let _lock = self.arbiter.acquire(&self.root).await?;
        let path = self.status_path(&scope, record.node());

        let current = fsutil::read_json::<NodeStatusRecord>(&path)
            .await?
            .ok_or_else(|| {
                KcacheError::NotFound(format!("status record {}/{}", scope, record.node()))
            })?;
        if current.metadata.resource_version != record.metadata.resource_version
            || current.metadata.uid != record.metadata.uid
        {
            return Err(KcacheError::Conflict {
                scope: scope.to_string(),
                name: record.node().to_string(),
            });
        }

        let mut updated = record.clone();
        updated.metadata.resource_version += 1;
        fsutil::write_json_atomic(&path, &updated).await?;
        Ok(updated)
    }
}

/// `FileClusterState` seen through one scope kind
#[derive(Debug, Clone)]
pub struct ScopedState {
    state: Arc<FileClusterState>,
    kind: ScopeKind,
}

impl ScopedState {
    pub fn state(&self) -> &FileClusterState {
        &self.state
    }

    fn check_scope(&self, scope: &ScopeKey) -> KcacheResult<()> {
        if scope.kind() != self.kind {
            return Err(KcacheError::Internal(format!(
                "{} scope {} passed to {} API",
                scope.kind(),
                scope,
                self.kind
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ScopeApi for ScopedState {
    fn kind(&self) -> ScopeKind {
        self.kind
    }

    async fn list_declarations(&self) -> KcacheResult<Vec<CacheDeclaration>> {
        self.state.list_declarations_of(Some(self.kind)).await
    }

    async fn get_status(
        &self,
        scope: &ScopeKey,
        node: &str,
    ) -> KcacheResult<Option<NodeStatusRecord>> {
        self.check_scope(scope)?;
        self.state.get_status(scope, node).await
    }

    async fn list_status(&self, node: &str) -> KcacheResult<Vec<NodeStatusRecord>> {
        self.state.list_status_of(Some(self.kind), Some(node)).await
    }

    async fn create_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord> {
        self.check_scope(&record.scope()?)?;
        self.state.create_status(record).await
    }

    async fn update_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord> {
        self.check_scope(&record.scope()?)?;
        self.state.update_status(record).await
    }
}
