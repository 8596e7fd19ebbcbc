//! Cache identity: scope, name and content digest
//!
//! The on-disk layout of both databases is derived from these keys, so all
//! validation happens at construction time.

use crate::error::{KcacheError, KcacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory marker used for cluster-scoped caches
pub const CLUSTER_SCOPE_DIR: &str = "cluster-scoped";

/// Which family of declarations a reconciler owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Declarations bound to a namespace
    Namespaced,
    /// Declarations without a namespace
    Cluster,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced => write!(f, "namespaced"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Scope of a cache: a namespace or the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Cluster,
    Namespace(String),
}

impl ScopeKey {
    /// Build a namespace scope, validating the name
    pub fn namespace(ns: impl Into<String>) -> KcacheResult<Self> {
        let ns = ns.into();
        validate_segment("namespace", &ns)?;
        if ns == CLUSTER_SCOPE_DIR {
            return Err(KcacheError::InvalidKey(format!(
                "namespace '{ns}' collides with the cluster scope marker"
            )));
        }
        Ok(Self::Namespace(ns))
    }

    /// Map an optional namespace to a scope; empty means cluster
    pub fn from_namespace(ns: Option<&str>) -> KcacheResult<Self> {
        match ns {
            None | Some("") => Ok(Self::Cluster),
            Some(ns) => Self::namespace(ns),
        }
    }

    /// Parse a scope from its directory name
    pub fn from_dir_name(dir: &str) -> KcacheResult<Self> {
        if dir == CLUSTER_SCOPE_DIR {
            Ok(Self::Cluster)
        } else {
            Self::namespace(dir)
        }
    }

    /// Directory name of this scope under a database root
    pub fn dir_name(&self) -> &str {
        match self {
            Self::Cluster => CLUSTER_SCOPE_DIR,
            Self::Namespace(ns) => ns,
        }
    }

    /// Namespace, if any
    pub fn namespace_str(&self) -> Option<&str> {
        match self {
            Self::Cluster => None,
            Self::Namespace(ns) => Some(ns),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Cluster => ScopeKind::Cluster,
            Self::Namespace(_) => ScopeKind::Namespaced,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Full identity of one extracted cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub scope: ScopeKey,
    pub name: String,
    pub digest: String,
}

impl CacheKey {
    /// Build a key, validating name and digest
    pub fn new(
        scope: ScopeKey,
        name: impl Into<String>,
        digest: impl Into<String>,
    ) -> KcacheResult<Self> {
        let name = name.into();
        let digest = digest.into();
        validate_name(&name)?;
        validate_digest(&digest)?;
        Ok(Self {
            scope,
            name,
            digest,
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.scope, self.name, self.digest)
    }
}

/// Validate a cache name
pub fn validate_name(name: &str) -> KcacheResult<()> {
    validate_segment("name", name)
}

/// Reject anything that cannot be a single path segment
fn validate_segment(what: &str, value: &str) -> KcacheResult<()> {
    if value.is_empty() {
        return Err(KcacheError::InvalidKey(format!("{what} is empty")));
    }
    if value.starts_with('.') {
        return Err(KcacheError::InvalidKey(format!(
            "{what} '{value}' must not start with '.'"
        )));
    }
    if value.contains('/') || value.contains('\\') || value.contains('\0') {
        return Err(KcacheError::InvalidKey(format!(
            "{what} '{value}' contains a path separator"
        )));
    }
    Ok(())
}

/// Digests look like `<algorithm>:<hex>`
pub fn validate_digest(digest: &str) -> KcacheResult<()> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| KcacheError::InvalidKey(format!("digest '{digest}' has no algorithm")))?;

    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    {
        return Err(KcacheError::InvalidKey(format!(
            "digest '{digest}' has an invalid algorithm"
        )));
    }

    let bytes = hex::decode(encoded)
        .map_err(|e| KcacheError::InvalidKey(format!("digest '{digest}' is not hex: {e}")))?;
    if algorithm == "sha256" && bytes.len() != 32 {
        return Err(KcacheError::InvalidKey(format!(
            "sha256 digest '{digest}' must be 64 hex characters"
        )));
    }
    if bytes.is_empty() {
        return Err(KcacheError::InvalidKey(format!("digest '{digest}' is empty")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    #[test]
    fn scope_dir_names() {
        assert_eq!(ScopeKey::Cluster.dir_name(), "cluster-scoped");
        assert_eq!(ScopeKey::namespace("ml").unwrap().dir_name(), "ml");
        assert_eq!(ScopeKey::from_namespace(Some("")).unwrap(), ScopeKey::Cluster);
        assert_eq!(ScopeKey::from_namespace(None).unwrap(), ScopeKey::Cluster);
    }

    #[test]
    fn scope_marker_collision_rejected() {
        assert!(ScopeKey::namespace("cluster-scoped").is_err());
        assert_eq!(
            ScopeKey::from_dir_name("cluster-scoped").unwrap(),
            ScopeKey::Cluster
        );
    }

    #[test]
    fn scope_kind() {
        assert_eq!(ScopeKey::Cluster.kind(), ScopeKind::Cluster);
        assert_eq!(
            ScopeKey::namespace("ml").unwrap().kind(),
            ScopeKind::Namespaced
        );
    }

    #[test]
    fn key_rejects_path_tricks() {
        assert!(CacheKey::new(ScopeKey::Cluster, "../etc", digest('a')).is_err());
        assert!(CacheKey::new(ScopeKey::Cluster, "a/b", digest('a')).is_err());
        assert!(CacheKey::new(ScopeKey::Cluster, "", digest('a')).is_err());
        assert!(ScopeKey::namespace(".hidden").is_err());
    }

    #[test]
    fn digest_validation() {
        assert!(validate_digest(&digest('a')).is_ok());
        assert!(validate_digest("sha512:abcd").is_ok());
        assert!(validate_digest("latest").is_err());
        assert!(validate_digest("sha256:abcd").is_err());
        assert!(validate_digest("sha256:zz").is_err());
        assert!(validate_digest("SHA256:abcd").is_err());
    }

    #[test]
    fn key_display() {
        let key = CacheKey::new(ScopeKey::Cluster, "yellow", digest('b')).unwrap();
        assert!(key.to_string().starts_with("cluster-scoped/yellow@sha256:bbbb"));
    }
}
