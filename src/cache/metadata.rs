//! Per-name metadata record (`cache.json`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// File name of the metadata record inside each name directory
pub const METADATA_FILE: &str = "cache.json";

/// Metadata shared by all digests extracted under one cache name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Image reference as declared (tag or digest form)
    pub image: String,

    /// Digest of the most recent extraction
    pub resolved_digest: String,

    /// Extracted size in bytes, per digest
    #[serde(default, alias = "sizeByDigest")]
    pub sizes: BTreeMap<String, u64>,
}

impl CacheMetadata {
    pub fn new(image: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        let digest = digest.into();
        let mut sizes = BTreeMap::new();
        sizes.insert(digest.clone(), size);
        Self {
            image: image.into(),
            resolved_digest: digest,
            sizes,
        }
    }

    /// Record a (re-)extraction of `digest`
    pub fn record(&mut self, image: &str, digest: &str, size: u64) {
        self.image = image.to_string();
        self.resolved_digest = digest.to_string();
        self.sizes.insert(digest.to_string(), size);
    }

    /// Clear the size entry of a removed digest; the image stays as it was
    pub fn forget(&mut self, digest: &str) -> bool {
        self.sizes.remove(digest).is_some()
    }

    pub fn size_of(&self, digest: &str) -> Option<u64> {
        self.sizes.get(digest).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let meta = CacheMetadata::new("quay.io/k/yellow:v1", "sha256:aa", 10);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["resolvedDigest"], "sha256:aa");
        assert_eq!(json["sizes"]["sha256:aa"], 10);
    }

    #[test]
    fn accepts_size_by_digest_alias() {
        let meta: CacheMetadata = serde_json::from_str(
            r#"{"image":"img","resolvedDigest":"sha256:aa","sizeByDigest":{"sha256:aa":5}}"#,
        )
        .unwrap();
        assert_eq!(meta.size_of("sha256:aa"), Some(5));
    }

    #[test]
    fn forget_keeps_image() {
        let mut meta = CacheMetadata::new("img:v1", "sha256:aa", 10);
        meta.record("img:v2", "sha256:bb", 20);
        assert!(meta.forget("sha256:aa"));
        assert!(!meta.forget("sha256:aa"));
        assert_eq!(meta.image, "img:v2");
        assert_eq!(meta.size_of("sha256:bb"), Some(20));
        assert_eq!(meta.size_of("sha256:aa"), None);
    }
}
