//! Audit journal of cache lifecycle events
//!
//! Writes JSON lines to `<state_dir>/audit.log`. On by default; a node
//! operator wants to know when bytes appeared and disappeared.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const CACHE_EXTRACTED: &str = "cache.extracted";
pub const CACHE_EXTRACT_FAILED: &str = "cache.extract_failed";
pub const CACHE_REMOVED: &str = "cache.removed";
pub const CACHE_OUTDATED: &str = "cache.outdated";

/// File-based audit logger that appends JSON lines
#[derive(Debug, Clone)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(config),
        }
    }

    /// Logger writing to `path`
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: path.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log an audit event as a JSON line
    ///
    /// Silently drops events on IO failure; the journal must never fail a
    /// reconciliation pass.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::with_path(dir.path().join("audit.log"));

        audit
            .log(
                CACHE_EXTRACTED,
                &serde_json::json!({"name": "yellowKernel", "size": 4096}),
            )
            .await;

        let content = tokio::fs::read_to_string(audit.path()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "cache.extracted");
        assert_eq!(parsed["data"]["name"], "yellowKernel");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::with_path(dir.path().join("nested/audit.log"));

        audit.log(CACHE_EXTRACTED, &serde_json::json!({})).await;
        audit.log(CACHE_REMOVED, &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(audit.path()).await.unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.audit_log = false;
        config.storage.state_dir = dir.path().to_path_buf();
        let audit = AuditLog::new(&config);

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path().exists());
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let audit = AuditLog::with_path(blocker.join("audit.log"));

        audit.log(CACHE_OUTDATED, &serde_json::json!({})).await;
    }
}
