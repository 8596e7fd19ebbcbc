//! Drives a reconciler on its requeue schedule
//!
//! A pass runs when the previous one asked for it, when the poll delay
//! expires, or when the trigger is notified (the stand-in for a watch
//! event). Every pass gets a child token of `shutdown` that is cancelled
//! once `pass_timeout` elapses.

use crate::cluster::ScopeApi;
use crate::reconcile::engine::{NodeReconciler, ReconcileOutcome, Requeue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run passes until `shutdown` is cancelled; returns the number of passes
pub async fn run<A: ScopeApi>(
    reconciler: Arc<NodeReconciler<A>>,
    trigger: Arc<Notify>,
    pass_timeout: Duration,
    shutdown: CancellationToken,
) -> usize {
    info!(
        "Reconciling {} caches on {}",
        reconciler.kind(),
        reconciler.node()
    );
    let mut passes = 0;

    while !shutdown.is_cancelled() {
        let outcome = pass_with_deadline(&*reconciler, pass_timeout, &shutdown).await;
        passes += 1;

        let delay = match outcome.requeue {
            Requeue::Immediate => continue,
            Requeue::After(delay) => Some(delay),
            Requeue::Never => None,
        };
        debug!("{} loop idle: {}", reconciler.kind(), outcome.requeue);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = trigger.notified() => debug!("{} loop triggered", reconciler.kind()),
            _ = wait(delay) => {}
        }
    }

    info!("{} loop stopped after {} pass(es)", reconciler.kind(), passes);
    passes
}

/// One pass under a child token of `parent` that is cancelled after `pass_timeout`
pub async fn pass_with_deadline<A: ScopeApi>(
    reconciler: &NodeReconciler<A>,
    pass_timeout: Duration,
    parent: &CancellationToken,
) -> ReconcileOutcome {
    let cancel = parent.child_token();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pass_timeout).await;
            cancel.cancel();
        })
    };

    let outcome = reconciler.reconcile(&cancel).await;
    deadline.abort();
    outcome
}

async fn wait(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
