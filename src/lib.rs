//! kcache - GPU kernel cache node agent
//!
//! Reconciles declared kernel caches against a node-local cache database,
//! extracting each admitted image digest once and removing it when it is
//! no longer declared and no longer mounted.

pub mod agent;
pub mod audit;
pub mod cache;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod extract;
pub mod fsutil;
pub mod gpu;
pub mod lock;
pub mod reconcile;
pub mod ui;
pub mod usage;

pub use error::{KcacheError, KcacheResult};
