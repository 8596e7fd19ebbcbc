//! Node status records: observed state, owned by the reconciler
//!
//! One record per (scope, node). The record is created without a status
//! because the API does not accept status on create; the GPU inventory is
//! the first status write.

use crate::cache::ScopeKey;
use crate::error::{KcacheError, KcacheResult};
use crate::gpu::GpuGroup;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Prefix of the per-declaration finalizers
pub const FINALIZER_PREFIX: &str = "kcache.dev/";

/// Label key carrying the node name
pub const HOST_LABEL: &str = "host";

pub fn cache_finalizer(name: &str) -> String {
    format!("{FINALIZER_PREFIX}{name}")
}

/// Condition of one (name, digest) on a node; exactly one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheCondition {
    Pending,
    Extracted,
    Running,
    Outdated,
    Error,
    UnloadError,
}

impl fmt::Display for CacheCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Extracted => "Extracted",
            Self::Running => "Running",
            Self::Outdated => "Outdated",
            Self::Error => "Error",
            Self::UnloadError => "UnloadError",
        };
        write!(f, "{}", name)
    }
}

/// Observed state of one extracted digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusEntry {
    pub condition: CacheCondition,

    #[serde(default)]
    pub compatible_device_ids: Vec<u32>,

    #[serde(default)]
    pub incompatible_device_ids: Vec<u32>,

    #[serde(default)]
    pub volume_size: u64,

    #[serde(default)]
    pub active_mounts: Vec<String>,

    pub last_updated: DateTime<Utc>,

    /// Failure reason for error conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CacheStatusEntry {
    pub fn new(condition: CacheCondition) -> Self {
        Self {
            condition,
            compatible_device_ids: vec![],
            incompatible_device_ids: vec![],
            volume_size: 0,
            active_mounts: vec![],
            last_updated: Utc::now(),
            message: None,
        }
    }

    /// Replace the active condition
    pub fn set_condition(&mut self, condition: CacheCondition, message: Option<String>) {
        self.condition = condition;
        self.message = message;
        self.last_updated = Utc::now();
    }

    /// Equal in everything but the timestamp
    pub fn same_observation(&self, other: &Self) -> bool {
        self.condition == other.condition
            && self.compatible_device_ids == other.compatible_device_ids
            && self.incompatible_device_ids == other.incompatible_device_ids
            && self.volume_size == other.volume_size
            && self.active_mounts == other.active_mounts
            && self.message == other.message
    }
}

/// Aggregate of entry conditions in one record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    /// Extracted, no active mount
    pub extracted: u32,
    /// Extracted and mounted
    pub in_use: u32,
    pub errored: u32,
    /// Superseded or undeclared but still mounted
    pub outdated: u32,
}

impl StatusCounts {
    pub fn add(&mut self, condition: CacheCondition) {
        match condition {
            CacheCondition::Extracted => self.extracted += 1,
            CacheCondition::Running => self.in_use += 1,
            CacheCondition::Error | CacheCondition::UnloadError => self.errored += 1,
            CacheCondition::Outdated => self.outdated += 1,
            CacheCondition::Pending => {}
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Status block of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub counts: StatusCounts,

    #[serde(default)]
    pub gpu_inventory: Vec<GpuGroup>,

    /// name -> digest -> entry
    #[serde(default)]
    pub cache_statuses: BTreeMap<String, BTreeMap<String, CacheStatusEntry>>,
}

/// Object metadata, as the API server keeps it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Node name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub uid: Uuid,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Bumped by the store on every write; stale writes are rejected
    #[serde(default)]
    pub resource_version: u64,

    pub created_at: DateTime<Utc>,
}

/// Per-scope, per-node observed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusRecord {
    pub metadata: RecordMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

impl NodeStatusRecord {
    /// A fresh record, not yet carrying any status
    pub fn new(scope: &ScopeKey, node: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(HOST_LABEL.to_string(), node.to_string());
        Self {
            metadata: RecordMeta {
                name: node.to_string(),
                namespace: scope.namespace_str().map(str::to_string),
                uid: Uuid::new_v4(),
                labels,
                finalizers: vec![],
                resource_version: 0,
                created_at: Utc::now(),
            },
            status: None,
        }
    }

    pub fn scope(&self) -> KcacheResult<ScopeKey> {
        ScopeKey::from_namespace(self.metadata.namespace.as_deref())
    }

    pub fn node(&self) -> &str {
        &self.metadata.name
    }

    /// Populate the status with the node's inventory
    pub fn set_inventory(&mut self, inventory: Vec<GpuGroup>) {
        self.status = Some(NodeStatus {
            gpu_inventory: inventory,
            ..NodeStatus::default()
        });
    }

    pub fn inventory(&self) -> &[GpuGroup] {
        self.status
            .as_ref()
            .map(|s| s.gpu_inventory.as_slice())
            .unwrap_or(&[])
    }

    pub fn counts(&self) -> StatusCounts {
        self.status.as_ref().map(|s| s.counts).unwrap_or_default()
    }

    /// Returns whether the stored counts changed
    pub fn set_counts(&mut self, counts: StatusCounts) -> KcacheResult<bool> {
        let status = self.status_mut()?;
        if status.counts == counts {
            return Ok(false);
        }
        status.counts = counts;
        Ok(true)
    }

    pub fn entry(&self, name: &str, digest: &str) -> Option<&CacheStatusEntry> {
        self.status
            .as_ref()
            .and_then(|s| s.cache_statuses.get(name))
            .and_then(|digests| digests.get(digest))
    }

    pub fn set_entry(
        &mut self,
        name: &str,
        digest: &str,
        entry: CacheStatusEntry,
    ) -> KcacheResult<()> {
        self.status_mut()?
            .cache_statuses
            .entry(name.to_string())
            .or_default()
            .insert(digest.to_string(), entry);
        Ok(())
    }

    /// Drop the entry for (name, digest)
    ///
    /// Once no entry remains for `name` the declaration's finalizer goes
    /// too, unless `keep_finalizer` says a live declaration still needs it.
    /// Returns whether anything changed.
    pub fn forget(&mut self, name: &str, digest: &str, keep_finalizer: bool) -> bool {
        let mut changed = false;
        let mut name_empty = true;

        if let Some(status) = self.status.as_mut() {
            if let Some(digests) = status.cache_statuses.get_mut(name) {
                changed |= digests.remove(digest).is_some();
                name_empty = digests.is_empty();
                if name_empty {
                    status.cache_statuses.remove(name);
                }
            }
        }

        if name_empty && !keep_finalizer {
            changed |= self.remove_finalizer(name);
        }
        changed
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        let finalizer = cache_finalizer(name);
        self.metadata.finalizers.iter().any(|f| *f == finalizer)
    }

    pub fn add_finalizer(&mut self, name: &str) -> bool {
        if self.has_finalizer(name) {
            return false;
        }
        self.metadata.finalizers.push(cache_finalizer(name));
        true
    }

    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let finalizer = cache_finalizer(name);
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| *f != finalizer);
        self.metadata.finalizers.len() != before
    }

    fn status_mut(&mut self) -> KcacheResult<&mut NodeStatus> {
        let node = self.metadata.name.clone();
        self.status
            .as_mut()
            .ok_or_else(|| {
                KcacheError::Internal(format!("status record for {node} has no status yet"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> NodeStatusRecord {
        let mut record = NodeStatusRecord::new(&ScopeKey::Cluster, "node-a");
        record.set_inventory(vec![]);
        record
    }

    #[test]
    fn new_record_has_host_label_and_no_status() {
        let record = NodeStatusRecord::new(&ScopeKey::namespace("ml").unwrap(), "node-a");
        assert_eq!(record.metadata.labels.get(HOST_LABEL).unwrap(), "node-a");
        assert_eq!(record.metadata.namespace.as_deref(), Some("ml"));
        assert!(record.status.is_none());
        assert!(record.inventory().is_empty());
    }

    #[test]
    fn set_entry_requires_status() {
        let mut record = NodeStatusRecord::new(&ScopeKey::Cluster, "node-a");
        let err = record
            .set_entry("y", "sha256:aa", CacheStatusEntry::new(CacheCondition::Pending))
            .unwrap_err();
        assert!(matches!(err, KcacheError::Internal(_)));
    }

    #[test]
    fn condition_is_single_valued() {
        let mut entry = CacheStatusEntry::new(CacheCondition::Extracted);
        entry.set_condition(CacheCondition::Error, Some("bad image".into()));
        entry.set_condition(CacheCondition::Running, None);
        assert_eq!(entry.condition, CacheCondition::Running);
        assert!(entry.message.is_none());
    }

    #[test]
    fn same_observation_ignores_timestamp() {
        let a = CacheStatusEntry::new(CacheCondition::Extracted);
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::seconds(30);
        assert!(a.same_observation(&b));
        b.active_mounts.push("vol-1".into());
        assert!(!a.same_observation(&b));
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut record = populated();
        assert!(record.add_finalizer("yellow"));
        assert!(!record.add_finalizer("yellow"));
        assert_eq!(record.metadata.finalizers, vec!["kcache.dev/yellow"]);
        assert!(record.remove_finalizer("yellow"));
        assert!(!record.remove_finalizer("yellow"));
    }

    #[test]
    fn forget_drops_finalizer_with_last_digest() {
        let mut record = populated();
        record.add_finalizer("yellow");
        record
            .set_entry("yellow", "sha256:aa", CacheStatusEntry::new(CacheCondition::Extracted))
            .unwrap();
        record
            .set_entry("yellow", "sha256:bb", CacheStatusEntry::new(CacheCondition::Outdated))
            .unwrap();

        assert!(record.forget("yellow", "sha256:bb", false));
        assert!(record.has_finalizer("yellow"));

        assert!(record.forget("yellow", "sha256:aa", false));
        assert!(!record.has_finalizer("yellow"));
        assert!(record.status.as_ref().unwrap().cache_statuses.is_empty());

        assert!(!record.forget("yellow", "sha256:aa", false));
    }

    #[test]
    fn forget_can_keep_finalizer() {
        let mut record = populated();
        record.add_finalizer("yellow");
        record
            .set_entry("yellow", "sha256:aa", CacheStatusEntry::new(CacheCondition::Extracted))
            .unwrap();

        assert!(record.forget("yellow", "sha256:aa", true));
        assert!(record.has_finalizer("yellow"));
    }

    #[test]
    fn counts_tally_conditions() {
        let mut counts = StatusCounts::default();
        for c in [
            CacheCondition::Extracted,
            CacheCondition::Running,
            CacheCondition::Running,
            CacheCondition::UnloadError,
            CacheCondition::Outdated,
            CacheCondition::Pending,
        ] {
            counts.add(c);
        }
        assert_eq!(
            counts,
            StatusCounts {
                extracted: 1,
                in_use: 2,
                errored: 1,
                outdated: 1
            }
        );
    }

    #[test]
    fn record_serializes_camel_case() {
        let mut record = populated();
        record
            .set_entry("yellow", "sha256:aa", CacheStatusEntry::new(CacheCondition::Extracted))
            .unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert!(json["metadata"]["resourceVersion"].is_number());
        assert_eq!(
            json["status"]["cacheStatuses"]["yellow"]["sha256:aa"]["condition"],
            "Extracted"
        );
        assert!(json["status"]["gpuInventory"].is_array());
    }
}
