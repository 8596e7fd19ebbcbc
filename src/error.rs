//! Error types for kcache
//!
//! All modules use `KcacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kcache operations
pub type KcacheResult<T> = Result<T, KcacheError>;

/// All errors that can occur in kcache
#[derive(Error, Debug)]
pub enum KcacheError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Node name is not configured")]
    NodeNameMissing,

    // Key and reference errors
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid image reference {image}: {reason}")]
    InvalidImageRef { image: String, reason: String },

    // Cluster-state errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting update of status record {scope}/{name}, re-fetch required")]
    Conflict { scope: String, name: String },

    // Extraction errors
    #[error("Extraction of {image} failed: {reason}")]
    Extraction { image: String, reason: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KcacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether the error is transient and the pass should simply be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Conflict { .. }
                | Self::Cancelled(_)
                | Self::CommandFailed { .. }
                | Self::Json(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NodeNameMissing => Some("Set KCACHE_NODE_NAME or node.name in the config"),
            Self::ConfigInvalid { .. } => Some("Run: kcache config show"),
            Self::CommandFailed { .. } => Some("Check extract.program in the config"),
            _ => None,
        }
    }
}
