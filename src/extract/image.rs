//! OCI image references

use crate::cache::key::validate_digest;
use crate::error::{KcacheError, KcacheResult};
use std::fmt;

/// An image reference split into repository, tag and digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `registry[:port]/path[:tag][@digest]`
    pub fn parse(image: &str) -> KcacheResult<Self> {
        let invalid = |reason: &str| KcacheError::InvalidImageRef {
            image: image.to_string(),
            reason: reason.to_string(),
        };

        if image.is_empty() {
            return Err(invalid("empty reference"));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest).map_err(|_| invalid("malformed digest"))?;
                (rest, Some(digest.to_string()))
            }
            None => (image, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(invalid("missing repository"));
        }
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Pin to `digest`, dropping any tag
    pub fn with_digest(&self, digest: &str) -> KcacheResult<Self> {
        validate_digest(digest)?;
        Ok(Self {
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
