//! Usage record of one extracted digest

use crate::cache::CacheKey;
use serde::{Deserialize, Serialize};

/// File name of the usage record inside each digest directory
pub const USAGE_FILE: &str = "usage.json";

/// Which mount handles currently reference an extracted cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    /// Name of the cache declaration
    pub cr_name: String,

    /// Namespace of the declaration, empty for cluster scope
    #[serde(default)]
    pub cr_namespace: String,

    pub digest: String,

    #[serde(default)]
    pub mount_handles: Vec<String>,

    pub ref_count: u32,

    /// Size of the mounted cache in bytes, as reported by the mount server
    #[serde(default)]
    pub volume_size: u64,
}

impl UsageEntry {
    pub fn new(key: &CacheKey, size: u64) -> Self {
        Self {
            cr_name: key.name.clone(),
            cr_namespace: key.scope.namespace_str().unwrap_or_default().to_string(),
            digest: key.digest.clone(),
            mount_handles: vec![],
            ref_count: 0,
            volume_size: size,
        }
    }

    /// Add a handle; returns false if it was already recorded
    pub fn acquire(&mut self, handle: &str) -> bool {
        if self.mount_handles.iter().any(|h| h == handle) {
            return false;
        }
        self.mount_handles.push(handle.to_string());
        self.ref_count += 1;
        true
    }

    /// Drop a handle; returns false if it was not recorded
    pub fn release(&mut self, handle: &str) -> bool {
        let before = self.mount_handles.len();
        self.mount_handles.retain(|h| h != handle);
        if self.mount_handles.len() == before {
            return false;
        }
        self.ref_count = self.ref_count.saturating_sub(1);
        true
    }

    pub fn holds(&self, handle: &str) -> bool {
        self.mount_handles.iter().any(|h| h == handle)
    }

    pub fn in_use(&self) -> bool {
        self.ref_count > 0
    }
}
