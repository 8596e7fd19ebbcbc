//! Cluster-state objects and the API the reconciler talks to

pub mod api;
pub mod declaration;
pub mod file_store;
pub mod status;

pub use api::ScopeApi;
pub use declaration::CacheDeclaration;
pub use file_store::{FileClusterState, ScopedState};
pub use status::{
    cache_finalizer, CacheCondition, CacheStatusEntry, NodeStatus, NodeStatusRecord, RecordMeta,
    StatusCounts, FINALIZER_PREFIX, HOST_LABEL,
};
