//! Usage registry shared with the mount server
//!
//! The mount server is the only writer (`add_usage`, `delete_usage`); the
//! reconciler only reads. Removal of an extracted cache consults this
//! registry first and refuses while any handle is recorded.

pub mod entry;
pub mod registry;

pub use entry::{UsageEntry, USAGE_FILE};
pub use registry::UsageRegistry;
