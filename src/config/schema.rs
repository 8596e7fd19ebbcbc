//! Configuration schema for kcache
//!
//! Configuration is stored at `~/.config/kcache/config.toml`

use crate::cache::ScopeKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Node identity
    pub node: NodeConfig,

    /// Database locations
    pub storage: StorageConfig,

    /// Reconcile loop timing
    pub reconcile: ReconcileConfig,

    /// Accelerator detection
    pub gpu: GpuConfig,

    /// External unpack primitive
    pub extract: ExtractConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Node identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name; environment variables take precedence
    pub name: Option<String>,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the cache database
    pub cache_root: PathBuf,

    /// Root of the usage registry
    pub usage_root: PathBuf,

    /// File-backed cluster state and the audit log
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/lib/kcache/caches"),
            usage_root: PathBuf::from("/var/lib/kcache/usage"),
            state_dir: PathBuf::from("/var/lib/kcache/state"),
        }
    }
}

/// Reconcile loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Delay before retrying a failed pass
    pub retry_secs: u64,

    /// Periodic poll while anything is declared or mounted
    pub poll_secs: u64,

    /// Deadline handed to every pass
    pub pass_timeout_secs: u64,

    /// Scope kinds the agent reconciles
    pub scopes: Vec<ScopeKind>,
}

impl ReconcileConfig {
    pub fn retry(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_secs: 5,
            poll_secs: 30,
            pass_timeout_secs: 600,
            scopes: vec![ScopeKind::Namespaced, ScopeKind::Cluster],
        }
    }
}

/// Accelerator detection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Stub detection and stub unpacking, for nodes without GPUs
    pub stub: bool,

    /// Alternate sysfs root (default: /sys)
    pub sysfs_root: Option<PathBuf>,
}

/// External unpack primitive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Program invoked per extraction
    pub program: String,

    /// Arguments placed before `--image`, `--dir` and `--devices`
    pub args: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            program: "kcache-unpack".to_string(),
            args: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[reconcile]"));

        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(
            parsed.reconcile.scopes,
            vec![ScopeKind::Namespaced, ScopeKind::Cluster]
        );
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.reconcile.retry(), Duration::from_secs(5));
        assert_eq!(config.reconcile.poll(), Duration::from_secs(30));
        assert!(!config.gpu.stub);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [reconcile]
            scopes = ["cluster"]

            [gpu]
            stub = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.reconcile.scopes, vec![ScopeKind::Cluster]);
        assert!(config.gpu.stub);
        assert_eq!(config.reconcile.pass_timeout_secs, 600); // default preserved
        assert_eq!(config.extract.program, "kcache-unpack");
    }
}
