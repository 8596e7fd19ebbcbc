//! Operator-facing output
//!
//! Uses `cliclack` log lines on a terminal and plain tagged lines
//! otherwise, so scripted runs and tests see stable text.

mod context;
mod output;

pub use context::UiContext;
pub use output::{step_info, step_ok, step_ok_detail, step_warn, step_warn_hint};
