//! Node reconciliation engine
//!
//! One `NodeReconciler` per scope kind. A pass lists the declarations of
//! its kind, cross-references the cache database and usage registry, and
//! commits at most one write before returning `Requeue::Immediate`. The
//! next pass re-reads everything, so a crash between passes only ever
//! repeats work.

use crate::audit::{AuditLog, CACHE_EXTRACTED, CACHE_EXTRACT_FAILED, CACHE_OUTDATED, CACHE_REMOVED};
use crate::cache::{CacheKey, ScopeKey, ScopeKind};
use crate::cluster::{
    CacheCondition, CacheDeclaration, CacheStatusEntry, NodeStatusRecord, ScopeApi, StatusCounts,
};
use crate::config::schema::ReconcileConfig;
use crate::error::{KcacheError, KcacheResult};
use crate::extract::{Extractor, Removal};
use crate::gpu::{self, GpuDetector};
use crate::reconcile::plan::{plan, Step};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// When the next pass should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing declared and nothing mounted
    Never,
    /// A write was committed; its watch event would re-trigger us
    Immediate,
    After(Duration),
}

impl fmt::Display for Requeue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "no requeue"),
            Self::Immediate => write!(f, "requeue now"),
            Self::After(d) => write!(f, "requeue after {}s", d.as_secs()),
        }
    }
}

/// Result of one pass
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub requeue: Requeue,
    pub error: Option<KcacheError>,
}

/// Requeue delays
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// After a failed pass
    pub retry: Duration,
    /// While anything is declared or mounted
    pub poll: Duration,
}

impl ReconcileSettings {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            retry: config.retry(),
            poll: config.poll(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

/// Whether a step committed a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Committed,
}

/// Condition counts per scope, gathered during a pass
type Tally = BTreeMap<ScopeKey, StatusCounts>;

fn tally_add(tally: &mut Tally, scope: &ScopeKey, condition: CacheCondition) {
    tally.entry(scope.clone()).or_default().add(condition);
}

fn event_data(key: &CacheKey, node: &str) -> serde_json::Value {
    serde_json::json!({
        "node": node,
        "scope": key.scope.to_string(),
        "name": key.name,
        "digest": key.digest,
    })
}

/// Digests recorded for `name` that are not on disk, other than `keep`
fn stale_digests(
    record: &NodeStatusRecord,
    scope: &ScopeKey,
    name: &str,
    keep: Option<&str>,
    seen: &BTreeMap<CacheKey, bool>,
) -> Vec<String> {
    let Some(digests) = record.status.as_ref().and_then(|s| s.cache_statuses.get(name)) else {
        return vec![];
    };
    digests
        .keys()
        .filter(|digest| keep != Some(digest.as_str()))
        .filter(|digest| {
            !seen
                .keys()
                .any(|k| k.scope == *scope && k.name == name && k.digest == **digest)
        })
        .cloned()
        .collect()
}

/// Reconciles one node for one scope kind
pub struct NodeReconciler<A> {
    node: String,
    api: A,
    extractor: Extractor,
    detector: Arc<dyn GpuDetector>,
    audit: AuditLog,
    settings: ReconcileSettings,
    pass: Mutex<()>,
}

impl<A: ScopeApi> NodeReconciler<A> {
    pub fn new(
        node: impl Into<String>,
        api: A,
        extractor: Extractor,
        detector: Arc<dyn GpuDetector>,
    ) -> Self {
        Self {
            node: node.into(),
            api,
            extractor,
            detector,
            audit: AuditLog::disabled(),
            settings: ReconcileSettings::default(),
            pass: Mutex::new(()),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn kind(&self) -> ScopeKind {
        self.api.kind()
    }

    /// Run one pass; concurrent calls queue behind each other
    ///
    /// `cancel` bounds extraction, the only long-running step.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> ReconcileOutcome {
        let _pass = self.pass.lock().await;

        match self.pass_once(cancel).await {
            Ok(requeue) => {
                debug!("{} pass on {}: {}", self.kind(), self.node, requeue);
                ReconcileOutcome {
                    requeue,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{} pass on {} failed: {}", self.kind(), self.node, e);
                ReconcileOutcome {
                    requeue: Requeue::After(self.settings.retry),
                    error: Some(e),
                }
            }
        }
    }

    async fn pass_once(&self, cancel: &CancellationToken) -> KcacheResult<Requeue> {
        let kind = self.kind();
        let declarations = self.api.list_declarations().await?;
        let mut seen: BTreeMap<CacheKey, bool> = self
            .extractor
            .store()
            .seen_map()
            .await?
            .into_iter()
            .filter(|(key, _)| key.scope.kind() == kind)
            .collect();

        if declarations.is_empty() && seen.is_empty() {
            return Ok(if self.write_counts(&Tally::new()).await? {
                Requeue::Immediate
            } else {
                Requeue::Never
            });
        }

        let mut tally = Tally::new();
        for declaration in &declarations {
            let flow = self
                .reconcile_declaration(declaration, &mut seen, &mut tally, cancel)
                .await?;
            if flow == Flow::Committed {
                return Ok(Requeue::Immediate);
            }
        }

        let stranded: Vec<CacheKey> = seen
            .into_iter()
            .filter_map(|(key, unmatched)| unmatched.then_some(key))
            .collect();
        for key in &stranded {
            if self.reconcile_stranded(key, &declarations, &mut tally).await? == Flow::Committed {
                return Ok(Requeue::Immediate);
            }
        }

        if self.write_counts(&tally).await? {
            return Ok(Requeue::Immediate);
        }

        let mounted = tally.values().any(|c| c.in_use > 0 || c.outdated > 0);
        Ok(if declarations.is_empty() && !mounted {
            Requeue::Never
        } else {
            Requeue::After(self.settings.poll)
        })
    }

    async fn reconcile_declaration(
        &self,
        declaration: &CacheDeclaration,
        seen: &mut BTreeMap<CacheKey, bool>,
        tally: &mut Tally,
        cancel: &CancellationToken,
    ) -> KcacheResult<Flow> {
        let scope = declaration.scope()?;
        let record = self.api.get_status(&scope, &self.node).await?;
        let on_disk = declaration
            .key()?
            .is_some_and(|key| seen.contains_key(&key));

        if let Some(mut record) = record.clone().filter(|r| r.status.is_some()) {
            let live = !declaration.deletion_requested;
            let keep = declaration.resolved_digest.as_deref().filter(|_| live);
            let stale = stale_digests(&record, &scope, &declaration.name, keep, seen);
            if !stale.is_empty() {
                for digest in &stale {
                    record.forget(&declaration.name, digest, live);
                }
                self.api.update_status(&record).await?;
                info!(
                    "Dropped {} entr(ies) of {}/{} with no bytes on disk",
                    stale.len(),
                    scope,
                    declaration.name
                );
                return Ok(Flow::Committed);
            }
        }

        let step = plan(declaration, record.as_ref(), on_disk)?;
        debug!("{}/{}: {}", scope, declaration.name, step);

        match step {
            Step::CreateRecord => {
                self.api
                    .create_status(&NodeStatusRecord::new(&scope, &self.node))
                    .await?;
                info!("Created status record {}/{}", scope, self.node);
                Ok(Flow::Committed)
            }

            Step::PopulateInventory => {
                let mut record = self.required(record, &scope)?;
                let inventory = self.detector.detect().await?;
                info!(
                    "Recording {} GPU group(s) for {}/{}",
                    inventory.len(),
                    scope,
                    self.node
                );
                record.set_inventory(inventory);
                // Same write as the inventory, so the first extraction is one pass away.
                if declaration.resolved_digest.is_some() && !declaration.deletion_requested {
                    record.add_finalizer(&declaration.name);
                }
                self.api.update_status(&record).await?;
                Ok(Flow::Committed)
            }

            Step::AwaitAdmission => Ok(Flow::Continue),

            Step::Remove(key) => {
                let mut record = self.required(record, &scope)?;
                seen.insert(key.clone(), false);

                match self.extractor.remove(&key).await? {
                    Removal::InUse { ref_count, .. } => {
                        debug!("{} awaits deletion, {} mount(s) left", key, ref_count);
                        tally_add(tally, &scope, CacheCondition::Running);
                        Ok(Flow::Continue)
                    }
                    removal => {
                        let removed = matches!(removal, Removal::Removed(_));
                        if removed {
                            self.audit.log(CACHE_REMOVED, &event_data(&key, &self.node)).await;
                        }
                        if record.forget(&key.name, &key.digest, false) {
                            self.api.update_status(&record).await?;
                            info!("Released {} on {}", key, self.node);
                            return Ok(Flow::Committed);
                        }
                        Ok(if removed { Flow::Committed } else { Flow::Continue })
                    }
                }
            }

            Step::Refresh(key) => {
                let mut record = self.required(record, &scope)?;
                seen.insert(key.clone(), false);

                let prior = record.entry(&key.name, &key.digest).cloned();
                let live = self.live_entry(&key, prior.as_ref()).await?;
                tally_add(tally, &scope, live.condition);

                let finalizer_added = record.add_finalizer(&key.name);
                let changed = prior.is_none_or(|p| !p.same_observation(&live));
                if !changed && !finalizer_added {
                    return Ok(Flow::Continue);
                }
                if changed {
                    debug!("{} is now {}", key, live.condition);
                    record.set_entry(&key.name, &key.digest, live)?;
                }
                self.api.update_status(&record).await?;
                Ok(Flow::Committed)
            }

            Step::SkipErrored(key) => {
                seen.insert(key, false);
                tally_add(tally, &scope, CacheCondition::Error);
                Ok(Flow::Continue)
            }

            Step::AddFinalizer(key) => {
                let mut record = self.required(record, &scope)?;
                if self.api.ensure_finalizer(&mut record, &key.name).await? {
                    debug!("Added finalizer for {} on {}/{}", key.name, scope, self.node);
                    return Ok(Flow::Committed);
                }
                Ok(Flow::Continue)
            }

            Step::Extract(key) => {
                let record = self.required(record, &scope)?;
                let devices = gpu::device_ids(record.inventory());
                let entry = self
                    .extract_entry(&key, &declaration.image, &devices, cancel)
                    .await?;
                self.commit_entry(record, &key, entry).await?;
                Ok(Flow::Committed)
            }
        }
    }

    /// Run the extraction; terminal failures become an `Error` entry
    async fn extract_entry(
        &self,
        key: &CacheKey,
        image: &str,
        devices: &[u32],
        cancel: &CancellationToken,
    ) -> KcacheResult<CacheStatusEntry> {
        let mut data = event_data(key, &self.node);
        data["image"] = serde_json::json!(image);

        match self.extractor.extract(key, image, devices, cancel).await {
            Ok(extracted) => {
                let mut entry = CacheStatusEntry::new(CacheCondition::Extracted);
                entry.compatible_device_ids = extracted.compatibility.compatible;
                entry.incompatible_device_ids = extracted.compatibility.incompatible;
                entry.volume_size = extracted.size;

                info!("Extracted {} ({} bytes)", key, extracted.size);
                data["size"] = serde_json::json!(extracted.size);
                self.audit.log(CACHE_EXTRACTED, &data).await;
                Ok(entry)
            }
            Err(e @ (KcacheError::Extraction { .. } | KcacheError::InvalidImageRef { .. })) => {
                let mut entry = CacheStatusEntry::new(CacheCondition::Pending);
                entry.set_condition(CacheCondition::Error, Some(e.to_string()));

                data["error"] = serde_json::json!(e.to_string());
                self.audit.log(CACHE_EXTRACT_FAILED, &data).await;
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `entry`, re-fetching once if the record moved underneath us
    ///
    /// Extraction can take long enough for the record to change; losing the
    /// compatibility verdict would leave it unrecoverable until the digest
    /// changes.
    async fn commit_entry(
        &self,
        mut record: NodeStatusRecord,
        key: &CacheKey,
        entry: CacheStatusEntry,
    ) -> KcacheResult<()> {
        record.set_entry(&key.name, &key.digest, entry.clone())?;
        match self.api.update_status(&record).await {
            Err(KcacheError::Conflict { .. }) => {
                debug!("Status record for {} changed during extraction, re-fetching", key);
                let fresh = self.api.get_status(&key.scope, &self.node).await?;
                let mut fresh = self.required(fresh, &key.scope)?;
                fresh.set_entry(&key.name, &key.digest, entry)?;
                self.api.update_status(&fresh).await?;
                Ok(())
            }
            result => result.map(|_| ()),
        }
    }

    /// Entry as the databases see it now
    ///
    /// Device compatibility is only known at extraction time and is carried
    /// over from `prior`.
    async fn live_entry(
        &self,
        key: &CacheKey,
        prior: Option<&CacheStatusEntry>,
    ) -> KcacheResult<CacheStatusEntry> {
        let size = self.extractor.store().size_of(key).await?.unwrap_or_default();
        let mounts = self
            .extractor
            .usage()
            .get_usage(key)
            .await?
            .map(|u| u.mount_handles)
            .unwrap_or_default();

        let condition = if mounts.is_empty() {
            CacheCondition::Extracted
        } else {
            CacheCondition::Running
        };
        let mut entry = CacheStatusEntry::new(condition);
        entry.volume_size = size;
        entry.active_mounts = mounts;
        if let Some(prior) = prior {
            entry.compatible_device_ids = prior.compatible_device_ids.clone();
            entry.incompatible_device_ids = prior.incompatible_device_ids.clone();
        }
        Ok(entry)
    }

    /// Handle an on-disk digest no live declaration claimed this pass
    async fn reconcile_stranded(
        &self,
        key: &CacheKey,
        declarations: &[CacheDeclaration],
        tally: &mut Tally,
    ) -> KcacheResult<Flow> {
        let record = self.api.get_status(&key.scope, &self.node).await?;
        let declared = declarations.iter().any(|d| {
            !d.deletion_requested && d.name == key.name && d.scope().is_ok_and(|s| s == key.scope)
        });

        match self.extractor.remove(key).await {
            Ok(Removal::InUse { handles, .. }) => {
                tally_add(tally, &key.scope, CacheCondition::Outdated);
                let Some(mut record) = record.filter(|r| r.status.is_some()) else {
                    debug!("{} is stranded and mounted, no status record to mark", key);
                    return Ok(Flow::Continue);
                };

                let prior = record.entry(&key.name, &key.digest).cloned();
                let mut entry = prior
                    .clone()
                    .unwrap_or_else(|| CacheStatusEntry::new(CacheCondition::Outdated));
                entry.active_mounts = handles;
                if let Some(size) = self.extractor.store().size_of(key).await? {
                    entry.volume_size = size;
                }
                if entry.condition != CacheCondition::Outdated {
                    entry.set_condition(CacheCondition::Outdated, None);
                }
                if prior.is_some_and(|p| p.same_observation(&entry)) {
                    return Ok(Flow::Continue);
                }

                record.set_entry(&key.name, &key.digest, entry)?;
                self.api.update_status(&record).await?;
                info!("{} is no longer declared but still mounted, marked Outdated", key);
                self.audit.log(CACHE_OUTDATED, &event_data(key, &self.node)).await;
                Ok(Flow::Committed)
            }

            Ok(removal) => {
                let removed = matches!(removal, Removal::Removed(_));
                if removed {
                    info!("Garbage-collected stranded {}", key);
                    self.audit.log(CACHE_REMOVED, &event_data(key, &self.node)).await;
                }
                if let Some(mut record) = record {
                    if record.forget(&key.name, &key.digest, declared) {
                        self.api.update_status(&record).await?;
                        return Ok(Flow::Committed);
                    }
                }
                Ok(if removed { Flow::Committed } else { Flow::Continue })
            }

            Err(e) => {
                if let Some(mut record) = record.filter(|r| r.status.is_some()) {
                    let mut entry = record
                        .entry(&key.name, &key.digest)
                        .cloned()
                        .unwrap_or_else(|| CacheStatusEntry::new(CacheCondition::UnloadError));
                    entry.set_condition(CacheCondition::UnloadError, Some(e.to_string()));

                    let written = match record.set_entry(&key.name, &key.digest, entry) {
                        Ok(()) => self.api.update_status(&record).await.map(|_| ()),
                        Err(err) => Err(err),
                    };
                    if let Err(write) = written {
                        warn!("Failed to record unload error for {}: {}", key, write);
                    }
                }
                Err(e)
            }
        }
    }

    /// Store `tally` on the first record whose counts differ
    async fn write_counts(&self, tally: &Tally) -> KcacheResult<bool> {
        for mut record in self.api.list_status(&self.node).await? {
            if record.status.is_none() {
                continue;
            }
            let counts = tally.get(&record.scope()?).copied().unwrap_or_default();
            if record.set_counts(counts)? {
                self.api.update_status(&record).await?;
                debug!("Updated counts of {}/{}: {:?}", record.scope()?, self.node, counts);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn required(
        &self,
        record: Option<NodeStatusRecord>,
        scope: &ScopeKey,
    ) -> KcacheResult<NodeStatusRecord> {
        record.ok_or_else(|| {
            let message = format!("status record {}/{} vanished mid-pass", scope, self.node);
            KcacheError::Internal(message)
        })
    }
}
