//! Configuration management for kcache

pub mod schema;

pub use schema::Config;

use crate::error::{KcacheError, KcacheResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variables consulted for the node name, in order
pub const NODE_NAME_VARS: [&str; 2] = ["KCACHE_NODE_NAME", "NODE_NAME"];

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kcache")
            .join("config.toml")
    }

    /// Root of the file-backed cluster state
    pub fn state_dir(config: &Config) -> &Path {
        &config.storage.state_dir
    }

    /// Get the audit log path
    pub fn audit_log_path(config: &Config) -> PathBuf {
        Self::state_dir(config).join("audit.log")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> KcacheResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> KcacheResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KcacheError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KcacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KcacheResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KcacheError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> KcacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KcacheError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure both database roots and the state directory exist
    pub async fn ensure_state_dirs(config: &Config) -> KcacheResult<()> {
        let dirs = [
            &config.storage.cache_root,
            &config.storage.usage_root,
            &config.storage.state_dir,
        ];

        for dir in dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                KcacheError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Name of this node
    ///
    /// `KCACHE_NODE_NAME`, then `NODE_NAME`, then `node.name`, then the
    /// host name from `/etc/hostname`.
    pub async fn node_name(config: &Config) -> KcacheResult<String> {
        Self::resolve_node_name(config, Path::new("/etc/hostname")).await
    }

    async fn resolve_node_name(config: &Config, hostname_file: &Path) -> KcacheResult<String> {
        let from_env = NODE_NAME_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        if let Some(name) = from_env {
            return Ok(name);
        }

        if let Some(name) = config.node.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }

        match fs::read_to_string(hostname_file).await {
            Ok(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
            _ => Err(KcacheError::NodeNameMissing),
        }
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_node_env() {
        for var in NODE_NAME_VARS {
            std::env::remove_var(var);
        }
    }

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.reconcile.poll_secs, 30);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.node.name = Some("node-a".to_string());

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.node.name.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn invalid_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[reconcile]\nretry_secs = \"soon\"\n").unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, KcacheError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn node_name_prefers_env() {
        clear_node_env();
        let mut config = Config::default();
        config.node.name = Some("from-config".to_string());

        std::env::set_var("NODE_NAME", "from-node-name");
        assert_eq!(
            ConfigManager::node_name(&config).await.unwrap(),
            "from-node-name"
        );

        std::env::set_var("KCACHE_NODE_NAME", "from-kcache");
        assert_eq!(ConfigManager::node_name(&config).await.unwrap(), "from-kcache");

        clear_node_env();
        assert_eq!(ConfigManager::node_name(&config).await.unwrap(), "from-config");
    }

    #[tokio::test]
    #[serial]
    async fn node_name_falls_back_to_hostname() {
        clear_node_env();
        let temp = TempDir::new().unwrap();
        let hostname = temp.path().join("hostname");
        let config = Config::default();

        let err = ConfigManager::resolve_node_name(&config, &hostname)
            .await
            .unwrap_err();
        assert!(matches!(err, KcacheError::NodeNameMissing));

        std::fs::write(&hostname, "node-b\n").unwrap();
        assert_eq!(
            ConfigManager::resolve_node_name(&config, &hostname)
                .await
                .unwrap(),
            "node-b"
        );
    }

    #[tokio::test]
    async fn ensure_state_dirs_creates_roots() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.cache_root = temp.path().join("caches");
        config.storage.usage_root = temp.path().join("usage");
        config.storage.state_dir = temp.path().join("state");

        ConfigManager::ensure_state_dirs(&config).await.unwrap();

        assert!(config.storage.cache_root.is_dir());
        assert!(config.storage.usage_root.is_dir());
        assert_eq!(
            ConfigManager::audit_log_path(&config),
            temp.path().join("state/audit.log")
        );
    }
}
