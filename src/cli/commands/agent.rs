//! Agent command - run the reconcile loops

use crate::agent::{cancel_on_signal, Agent};
use crate::cli::args::AgentArgs;
use crate::config::Config;
use crate::error::KcacheResult;
use crate::ui::{self, UiContext};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Execute the agent command
pub async fn execute(args: AgentArgs, config: &Config) -> KcacheResult<()> {
    let agent = Agent::from_config(config).await?;
    let shutdown = cancel_on_signal();

    if args.once {
        return settle_all(&agent, &shutdown).await;
    }

    let passes = agent.run(shutdown).await?;
    info!("Agent stopped after {} pass(es)", passes);
    Ok(())
}

async fn settle_all(agent: &Agent, shutdown: &CancellationToken) -> KcacheResult<()> {
    let ctx = UiContext::detect();

    for &kind in agent.scopes() {
        let (passes, outcome) = agent.settle(kind, shutdown).await;
        if let Some(e) = outcome.error {
            return Err(e);
        }
        ui::step_ok_detail(
            &ctx,
            &format!("{} caches settled on {}", kind, agent.node()),
            &format!("{} pass(es), {}", passes, outcome.requeue),
        );
    }
    Ok(())
}
