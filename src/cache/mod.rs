//! Content-addressed database of extracted kernel caches
//!
//! Caches are keyed by (scope, name, digest). Each digest directory is
//! immutable once committed; a new image digest lands next to the old one
//! and the old one is garbage-collected once nothing mounts it.
//!
//! # Entry States
//!
//! | On disk | Meaning |
//! |---------|---------|
//! | `.<digest>.partial/` | extraction in progress or interrupted |
//! | `<digest>/` + size in `cache.json` | extracted, mountable |
//! | absent | never extracted or removed |

pub mod key;
pub mod metadata;
pub mod store;

pub use key::{CacheKey, ScopeKey, ScopeKind, CLUSTER_SCOPE_DIR};
pub use metadata::{CacheMetadata, METADATA_FILE};
pub use store::{CacheStore, Pruned, StoredCache};

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
