//! Wiring of the node agent from configuration
//!
//! Picks the GPU detector and unpacker for the configured mode and builds
//! one reconciler per scope kind over shared database handles.

use crate::audit::AuditLog;
use crate::cache::{CacheStore, ScopeKind};
use crate::cluster::{FileClusterState, ScopedState};
use crate::config::{Config, ConfigManager};
use crate::error::{KcacheError, KcacheResult};
use crate::extract::{CommandUnpacker, Extractor, StubUnpacker, Unpacker};
use crate::gpu::{GpuDetector, StubDetector, SysfsDetector};
use crate::lock::LockArbiter;
use crate::reconcile::{self, NodeReconciler, ReconcileOutcome, ReconcileSettings, Requeue};
use crate::usage::UsageRegistry;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on passes for a settle run
const SETTLE_LIMIT: usize = 64;

/// Create the accelerator detector for the configured mode
pub fn create_detector(config: &Config) -> Arc<dyn GpuDetector> {
    if config.gpu.stub {
        return Arc::new(StubDetector);
    }
    match &config.gpu.sysfs_root {
        Some(root) => Arc::new(SysfsDetector::with_root(root)),
        None => Arc::new(SysfsDetector::new()),
    }
}

/// Create the unpack primitive for the configured mode
pub fn create_unpacker(config: &Config) -> Arc<dyn Unpacker> {
    if config.gpu.stub {
        return Arc::new(StubUnpacker);
    }
    Arc::new(CommandUnpacker::new(
        config.extract.program.clone(),
        config.extract.args.clone(),
    ))
}

/// File-backed cluster state under the configured state directory
pub fn create_cluster_state(config: &Config) -> Arc<FileClusterState> {
    Arc::new(FileClusterState::new(
        ConfigManager::state_dir(config),
        LockArbiter::global(),
    ))
}

/// Database handles over the configured roots
pub fn create_extractor(config: &Config) -> Extractor {
    let arbiter = LockArbiter::global();
    Extractor::new(
        CacheStore::new(&config.storage.cache_root, arbiter.clone()),
        UsageRegistry::new(&config.storage.usage_root, arbiter),
        create_unpacker(config),
    )
}

/// Token cancelled on Ctrl-C, or SIGTERM on unix
pub fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down");
        stop.cancel();
    });
    token
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Everything a node needs to reconcile
pub struct Agent {
    node: String,
    config: Config,
    state: Arc<FileClusterState>,
    extractor: Extractor,
    detector: Arc<dyn GpuDetector>,
    audit: AuditLog,
}

impl Agent {
    pub async fn from_config(config: &Config) -> KcacheResult<Self> {
        let node = ConfigManager::node_name(config).await?;
        ConfigManager::ensure_state_dirs(config).await?;
        debug!("Agent for node {} (stub: {})", node, config.gpu.stub);

        Ok(Self {
            node,
            config: config.clone(),
            state: create_cluster_state(config),
            extractor: create_extractor(config),
            detector: create_detector(config),
            audit: AuditLog::new(config),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn state(&self) -> &Arc<FileClusterState> {
        &self.state
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Scope kinds from the configuration
    pub fn scopes(&self) -> &[ScopeKind] {
        &self.config.reconcile.scopes
    }

    pub fn reconciler(&self, kind: ScopeKind) -> NodeReconciler<ScopedState> {
        NodeReconciler::new(
            self.node.clone(),
            self.state.scoped(kind),
            self.extractor.clone(),
            Arc::clone(&self.detector),
        )
        .with_audit(self.audit.clone())
        .with_settings(ReconcileSettings::from_config(&self.config.reconcile))
    }

    /// Run passes for `kind` until one does not ask for an immediate requeue
    ///
    /// Each pass is bounded by `pass_timeout_secs` and by `shutdown`.
    pub async fn settle(
        &self,
        kind: ScopeKind,
        shutdown: &CancellationToken,
    ) -> (usize, ReconcileOutcome) {
        let reconciler = self.reconciler(kind);
        let pass_timeout = self.config.reconcile.pass_timeout();
        let mut passes = 0;
        loop {
            let outcome = reconcile::pass_with_deadline(&reconciler, pass_timeout, shutdown).await;
            passes += 1;
            if outcome.requeue != Requeue::Immediate
                || passes >= SETTLE_LIMIT
                || shutdown.is_cancelled()
            {
                return (passes, outcome);
            }
        }
    }

    /// Run one loop per configured scope kind until `shutdown`
    ///
    /// SIGHUP triggers an immediate pass on every loop.
    pub async fn run(&self, shutdown: CancellationToken) -> KcacheResult<usize> {
        let pass_timeout = self.config.reconcile.pass_timeout();
        let mut triggers = vec![];
        let mut loops = vec![];

        for &kind in self.scopes() {
            let trigger = Arc::new(Notify::new());
            triggers.push(Arc::clone(&trigger));
            loops.push(tokio::spawn(reconcile::run(
                Arc::new(self.reconciler(kind)),
                trigger,
                pass_timeout,
                shutdown.clone(),
            )));
        }
        info!("Agent running {} loop(s) on {}", loops.len(), self.node);

        #[cfg(unix)]
        {
            let shutdown = shutdown.clone();
            let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .map_err(|e| KcacheError::io("installing SIGHUP handler", e))?;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = hangup.recv() => {
                            if received.is_none() {
                                break;
                            }
                            debug!("SIGHUP, triggering all loops");
                            triggers.iter().for_each(|t| t.notify_one());
                        }
                    }
                }
            });
        }

        let mut passes = 0;
        for handle in loops {
            passes += handle
                .await
                .map_err(|e| KcacheError::Internal(format!("reconcile loop panicked: {e}")))?;
        }
        Ok(passes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::tests::digest;
    use crate::cache::ScopeKey;
    use crate::cluster::{CacheCondition, CacheDeclaration};
    use serial_test::serial;
    use tempfile::TempDir;

    fn stub_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.gpu.stub = true;
        config.node.name = Some("node-a".to_string());
        config.storage.cache_root = dir.path().join("caches");
        config.storage.usage_root = dir.path().join("usage");
        config.storage.state_dir = dir.path().join("state");
        config
    }

    #[tokio::test]
    #[serial]
    async fn settles_stub_declaration() {
        for var in crate::config::NODE_NAME_VARS {
            std::env::remove_var(var);
        }
        let dir = TempDir::new().unwrap();
        let agent = Agent::from_config(&stub_config(&dir)).await.unwrap();
        agent
            .state()
            .apply_declaration(
                CacheDeclaration::new(&ScopeKey::Cluster, "yellowKernel", "repo/yellow:v1")
                    .with_digest(digest('d')),
            )
            .await
            .unwrap();

        let (passes, outcome) = agent
            .settle(ScopeKind::Cluster, &CancellationToken::new())
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(passes, 5);
        let record = agent
            .state()
            .get_status(&ScopeKey::Cluster, "node-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.entry("yellowKernel", &digest('d')).unwrap().condition,
            CacheCondition::Extracted
        );
        assert!(dir.path().join("state/audit.log").exists());
    }

    #[tokio::test]
    #[serial]
    async fn settle_stops_on_shutdown() {
        for var in crate::config::NODE_NAME_VARS {
            std::env::remove_var(var);
        }
        let dir = TempDir::new().unwrap();
        let agent = Agent::from_config(&stub_config(&dir)).await.unwrap();
        agent
            .state()
            .apply_declaration(
                CacheDeclaration::new(&ScopeKey::Cluster, "yellowKernel", "repo/yellow:v1")
                    .with_digest(digest('d')),
            )
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let (passes, outcome) = agent.settle(ScopeKind::Cluster, &shutdown).await;

        assert_eq!(passes, 1);
        assert!(outcome.error.is_none());
        assert!(agent.extractor().store().list().await.unwrap().is_empty());
    }
}
