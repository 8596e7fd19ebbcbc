//! Reconcile command - run one pass per scope kind

use crate::agent::{cancel_on_signal, Agent};
use crate::cache::ScopeKind;
use crate::cli::args::ReconcileArgs;
use crate::config::Config;
use crate::error::KcacheResult;
use crate::reconcile::pass_with_deadline;
use crate::ui::{self, UiContext};

/// Execute the reconcile command
pub async fn execute(args: ReconcileArgs, config: &Config) -> KcacheResult<()> {
    let agent = Agent::from_config(config).await?;
    let ctx = UiContext::detect();
    let shutdown = cancel_on_signal();
    let pass_timeout = config.reconcile.pass_timeout();

    let kinds: Vec<ScopeKind> = match args.scope {
        Some(scope) => vec![scope.into()],
        None => agent.scopes().to_vec(),
    };

    for kind in kinds {
        let reconciler = agent.reconciler(kind);
        let outcome = pass_with_deadline(&reconciler, pass_timeout, &shutdown).await;
        if let Some(e) = outcome.error {
            return Err(e);
        }
        ui::step_ok_detail(
            &ctx,
            &format!("{} pass on {}", kind, agent.node()),
            &outcome.requeue.to_string(),
        );
    }
    Ok(())
}
