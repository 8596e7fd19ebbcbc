//! Node reconciliation
//!
//! - `plan`: which step a pass takes for one declaration
//! - `engine`: the per-node, per-scope-kind reconciler
//! - `runner`: the loop that schedules passes

pub mod engine;
pub mod plan;
pub mod runner;

pub use engine::{NodeReconciler, ReconcileOutcome, ReconcileSettings, Requeue};
pub use plan::{plan, NodePhase, Step};
pub use runner::{pass_with_deadline, run};
