//! Cluster-state API seam
//!
//! The reconciler is written against this trait and instantiated once per
//! scope kind. Implementations must reject stale `update_status` writes
//! with `KcacheError::Conflict`.

use crate::cache::{ScopeKey, ScopeKind};
use crate::cluster::declaration::CacheDeclaration;
use crate::cluster::status::NodeStatusRecord;
use crate::error::KcacheResult;
use async_trait::async_trait;

/// Capabilities the reconciler needs for one scope kind
#[async_trait]
pub trait ScopeApi: Send + Sync {
    /// Scope kind this instance serves
    fn kind(&self) -> ScopeKind;

    /// Every declaration of this kind (all namespaces for namespaced)
    async fn list_declarations(&self) -> KcacheResult<Vec<CacheDeclaration>>;

    async fn get_status(
        &self,
        scope: &ScopeKey,
        node: &str,
    ) -> KcacheResult<Option<NodeStatusRecord>>;

    /// Every record of this kind labelled for `node`
    async fn list_status(&self, node: &str) -> KcacheResult<Vec<NodeStatusRecord>>;

    /// Create a record; any status on it is dropped
    async fn create_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord>;

    /// Replace a record, returning the stored copy with its new version
    async fn update_status(&self, record: &NodeStatusRecord) -> KcacheResult<NodeStatusRecord>;

    /// Add the finalizer for `name` with a read-modify-write of `record`
    ///
    /// Returns whether a write happened; `record` is refreshed if so.
    async fn ensure_finalizer(
        &self,
        record: &mut NodeStatusRecord,
        name: &str,
    ) -> KcacheResult<bool> {
        if !record.add_finalizer(name) {
            return Ok(false);
        }
        *record = self.update_status(record).await?;
        Ok(true)
    }
}
