//! Cache declarations: the desired state, owned by the control plane

use crate::cache::{CacheKey, ScopeKey};
use crate::cluster::status::cache_finalizer;
use crate::error::KcacheResult;
use serde::{Deserialize, Serialize};

/// Desired state: extract `image` on every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDeclaration {
    pub name: String,

    /// Namespace, absent for cluster-scoped declarations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Image reference as written by the user (may be a tag)
    pub image: String,

    /// Digest set by admission once the image is verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_digest: Option<String>,

    /// Soft-delete marker; the declaration stays until finalizers clear
    #[serde(default)]
    pub deletion_requested: bool,
}

impl CacheDeclaration {
    pub fn new(scope: &ScopeKey, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: scope.namespace_str().map(str::to_string),
            image: image.into(),
            resolved_digest: None,
            deletion_requested: false,
        }
    }

    /// Admit the declaration at `digest`
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.resolved_digest = Some(digest.into());
        self
    }

    pub fn scope(&self) -> KcacheResult<ScopeKey> {
        ScopeKey::from_namespace(self.namespace.as_deref())
    }

    /// Key of the admitted digest; `None` until admission has run
    pub fn key(&self) -> KcacheResult<Option<CacheKey>> {
        match &self.resolved_digest {
            Some(digest) => Ok(Some(CacheKey::new(
                self.scope()?,
                self.name.clone(),
                digest.clone(),
            )?)),
            None => Ok(None),
        }
    }

    /// Finalizer this declaration places on status records
    pub fn finalizer(&self) -> String {
        cache_finalizer(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::tests::digest;

    #[test]
    fn unadmitted_declaration_has_no_key() {
        let decl = CacheDeclaration::new(&ScopeKey::Cluster, "yellowKernel", "repo/y:v1");
        assert!(decl.key().unwrap().is_none());
    }

    #[test]
    fn admitted_declaration_key() {
        let ns = ScopeKey::namespace("ml").unwrap();
        let decl = CacheDeclaration::new(&ns, "blue", "repo/b:v1").with_digest(digest('a'));

        let key = decl.key().unwrap().unwrap();
        assert_eq!(key.scope, ns);
        assert_eq!(key.name, "blue");
        assert_eq!(decl.finalizer(), "kcache.dev/blue");
    }

    #[test]
    fn cluster_declaration_omits_namespace() {
        let decl = CacheDeclaration::new(&ScopeKey::Cluster, "y", "repo/y:v1");
        let json = serde_json::to_value(&decl).unwrap();
        assert!(json.get("namespace").is_none());
        assert_eq!(json["deletionRequested"], false);
    }
}
