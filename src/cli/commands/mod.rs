//! CLI command implementations

pub mod agent;
pub mod cache;
pub mod completions;
pub mod config;
pub mod declare;
pub mod reconcile;
pub mod status;
pub mod usage;

pub use agent::execute as agent;
pub use cache::execute as cache;
pub use completions::execute as completions;
pub use config::execute as config;
pub use declare::execute as declare;
pub use reconcile::execute as reconcile;
pub use status::execute as status;
pub use usage::execute as usage;

/// First 19 characters of a digest (`sha256:` plus 12 hex)
pub(crate) fn short_digest(digest: &str) -> &str {
    match digest.char_indices().nth(19) {
        Some((end, _)) => &digest[..end],
        None => digest,
    }
}
