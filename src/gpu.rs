//! Accelerator inventory
//!
//! Detection runs once per status record; the result is stored in the
//! record and never refreshed.

use crate::error::{KcacheError, KcacheResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Devices of one type sharing a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuGroup {
    pub gpu_type: String,
    pub driver_version: String,
    pub device_ids: Vec<u32>,
}

/// All device ids across groups, in group order
pub fn device_ids(groups: &[GpuGroup]) -> Vec<u32> {
    groups
        .iter()
        .flat_map(|g| g.device_ids.iter().copied())
        .collect()
}

/// Source of the node's accelerator inventory
#[async_trait]
pub trait GpuDetector: Send + Sync {
    async fn detect(&self) -> KcacheResult<Vec<GpuGroup>>;
}

/// Fixed inventory for nodes without accelerators
#[derive(Debug, Clone, Default)]
pub struct StubDetector;

#[async_trait]
impl GpuDetector for StubDetector {
    async fn detect(&self) -> KcacheResult<Vec<GpuGroup>> {
        Ok(vec![GpuGroup {
            gpu_type: "stub".to_string(),
            driver_version: "0.0.0".to_string(),
            device_ids: vec![0, 1, 2],
        }])
    }
}

/// Detects GPUs from DRM devices in sysfs
#[derive(Debug, Clone)]
pub struct SysfsDetector {
    drm_dir: PathBuf,
    module_dir: PathBuf,
}

impl SysfsDetector {
    pub fn new() -> Self {
        Self {
            drm_dir: PathBuf::from("/sys/class/drm"),
            module_dir: PathBuf::from("/sys/module"),
        }
    }

    /// Detector reading from an alternate sysfs tree
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            drm_dir: root.join("class/drm"),
            module_dir: root.join("module"),
        }
    }

    fn vendor_info(vendor: &str) -> Option<(&'static str, &'static str)> {
        match vendor {
            "0x10de" => Some(("nvidia", "nvidia")),
            "0x1002" => Some(("amd", "amdgpu")),
            "0x8086" => Some(("intel", "i915")),
            _ => None,
        }
    }

    async fn read_trimmed(path: PathBuf) -> Option<String> {
        fs::read_to_string(&path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// DRM primary nodes (`card0`, `card1`, ...) with their index
    async fn cards(&self) -> KcacheResult<Vec<(u32, String)>> {
        let mut cards = vec![];
        let mut entries = match fs::read_dir(&self.drm_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cards),
            Err(e) => return Err(KcacheError::io("reading DRM devices", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KcacheError::io("reading DRM entry", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(index) = name.strip_prefix("card").and_then(|i| i.parse::<u32>().ok()) {
                cards.push((index, name));
            }
        }
        cards.sort();
        Ok(cards)
    }
}

impl Default for SysfsDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuDetector for SysfsDetector {
    async fn detect(&self) -> KcacheResult<Vec<GpuGroup>> {
        let mut groups: BTreeMap<&'static str, GpuGroup> = BTreeMap::new();

        for (index, card) in self.cards().await? {
            let vendor_path = self.drm_dir.join(&card).join("device/vendor");
            let Some(vendor) = Self::read_trimmed(vendor_path).await else {
                continue;
            };
            let Some((gpu_type, driver)) = Self::vendor_info(&vendor) else {
                debug!("Ignoring {} with vendor {}", card, vendor);
                continue;
            };

            let driver_version = Self::read_trimmed(self.module_dir.join(driver).join("version"))
                .await
                .unwrap_or_else(|| "unknown".to_string());

            groups
                .entry(gpu_type)
                .or_insert_with(|| GpuGroup {
                    gpu_type: gpu_type.to_string(),
                    driver_version,
                    device_ids: vec![],
                })
                .device_ids
                .push(index);
        }

        let groups: Vec<GpuGroup> = groups.into_values().collect();
        debug!("Detected {} GPU group(s)", groups.len());
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_card(root: &std::path::Path, card: &str, vendor: &str) {
        let dir = root.join("class/drm").join(card).join("device");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
    }

    #[tokio::test]
    async fn stub_reports_three_devices() {
        let groups = StubDetector.detect().await.unwrap();
        assert_eq!(device_ids(&groups), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn sysfs_groups_by_vendor() {
        let root = TempDir::new().unwrap();
        add_card(root.path(), "card0", "0x10de");
        add_card(root.path(), "card1", "0x10de");
        add_card(root.path(), "card2", "0x1002");
        add_card(root.path(), "card3", "0x1234");
        std::fs::create_dir_all(root.path().join("class/drm/card0-DP-1")).unwrap();
        std::fs::create_dir_all(root.path().join("module/nvidia")).unwrap();
        std::fs::write(root.path().join("module/nvidia/version"), "550.54\n").unwrap();

        let groups = SysfsDetector::with_root(root.path()).detect().await.unwrap();

        assert_eq!(groups.len(), 2);
        let amd = groups.iter().find(|g| g.gpu_type == "amd").unwrap();
        assert_eq!(amd.device_ids, vec![2]);
        assert_eq!(amd.driver_version, "unknown");
        let nvidia = groups.iter().find(|g| g.gpu_type == "nvidia").unwrap();
        assert_eq!(nvidia.device_ids, vec![0, 1]);
        assert_eq!(nvidia.driver_version, "550.54");
    }

    #[tokio::test]
    async fn sysfs_without_drm_is_empty() {
        let root = TempDir::new().unwrap();
        let groups = SysfsDetector::with_root(root.path()).detect().await.unwrap();
        assert!(groups.is_empty());
    }
}
