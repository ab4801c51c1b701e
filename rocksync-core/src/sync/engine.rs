use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SyncConfig, SyncMode};
use crate::device::disk_usage;
use crate::events::{EventSink, SyncEvent, SyncOutcome};
use crate::metadata::MetadataExtractor;

use super::hash::FingerprintCache;
use super::index::{IndexError, IndexStore, TrackRecord};
use super::planner::{PlanError, PlanRequest, Selection, SyncPlan, SyncPlanner};
use super::prune::Pruner;
use super::scanner::{IndexScanner, RootKind, ScanError, snapshot_live, spawn_backfill};
use super::session::{SyncSession, human_bytes};
use super::transfer::{CopyEngine, CopyOutcome};
use super::transform::TransformPipeline;
use super::verify::{VerifyReport, VerifyTarget, Verifier};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync to {0} is already running")]
    AlreadyRunning(PathBuf),
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Planning,
    Copying,
    Verifying,
    Pruning,
    Transforming,
    IndexingDestination,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Phase::Idle => "Idle",
            Phase::Scanning => "Scanning",
            Phase::Planning => "Planning",
            Phase::Copying => "Copying",
            Phase::Verifying => "Verifying",
            Phase::Pruning => "Removing extra files",
            Phase::Transforming => "Transforming",
            Phase::IndexingDestination => "Indexing destination",
        };
        f.write_str(text)
    }
}

/// Why a run stopped before its last phase.
enum Halt {
    Cancelled,
    Fatal(String),
}

impl From<ConfigError> for Halt {
    fn from(err: ConfigError) -> Self {
        Halt::Fatal(SyncError::Configuration(err).to_string())
    }
}

impl From<PlanError> for Halt {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Cancelled => Halt::Cancelled,
            other => Halt::Fatal(other.to_string()),
        }
    }
}

/// A run in flight. Events arrive on `events` until `Finished`.
pub struct SyncHandle {
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
    cancel: CancellationToken,
    task: JoinHandle<SyncOutcome>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> SyncOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => SyncOutcome::failed(Default::default(), format!("sync task failed: {err}")),
        }
    }

    /// Waits for the run and returns every event it produced.
    pub async fn join_with_events(mut self) -> (SyncOutcome, Vec<SyncEvent>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            let last = matches!(event, SyncEvent::Finished(_));
            events.push(event);
            if last {
                break;
            }
        }
        let outcome = self.join().await;
        (outcome, events)
    }
}

type Registry = Arc<Mutex<HashSet<PathBuf>>>;

/// Releases a destination claim when the run task ends.
struct RunGuard {
    registry: Registry,
    key: PathBuf,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    extractor: Arc<dyn MetadataExtractor>,
    transform: Option<Arc<dyn TransformPipeline>>,
    active: Registry,
}

impl SyncEngine {
    pub fn new(extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self {
            extractor,
            transform: None,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_transform(mut self, pipeline: Arc<dyn TransformPipeline>) -> Self {
        self.transform = Some(pipeline);
        self
    }

    pub fn is_running(&self, dest_root: &Path) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&registry_key(dest_root))
    }

    /// Spawns a run on its own task. A second run for the same destination
    /// is refused while the first is active.
    pub fn start(&self, config: SyncConfig) -> Result<SyncHandle, SyncError> {
        let guard = self.claim(&config.dest_root)?;
        let (sink, events) = EventSink::channel();
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            engine.run(config, sink, token).await
        });
        Ok(SyncHandle {
            events,
            cancel,
            task,
        })
    }

    fn claim(&self, dest_root: &Path) -> Result<RunGuard, SyncError> {
        let key = registry_key(dest_root);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(SyncError::AlreadyRunning(dest_root.to_path_buf()));
        }
        Ok(RunGuard {
            registry: self.active.clone(),
            key,
        })
    }

    /// Drives one run to completion on the current task. Always ends with a
    /// `Finished` event carrying the returned outcome.
    pub async fn run(&self, config: SyncConfig, sink: EventSink, cancel: CancellationToken) -> SyncOutcome {
        let mut session = SyncSession::new(sink.clone(), cancel, config.progress_interval);
        info!(
            mode = config.mode.label(),
            source = %config.source_root.display(),
            dest = %config.dest_root.display(),
            "sync started"
        );

        let result = self.run_phases(&config, &mut session).await;
        let summary = session.summary;
        let outcome = match result {
            Ok(()) if session.is_cancelled() => SyncOutcome::cancelled(summary),
            Ok(()) => SyncOutcome::finished(summary),
            Err(Halt::Cancelled) => SyncOutcome::cancelled(summary),
            Err(Halt::Fatal(message)) => {
                warn!(error = %message, "sync failed");
                sink.log(format!("! {message}"));
                SyncOutcome::failed(summary, message)
            }
        };

        sink.log(format!(
            "Done. copied={}, updated={}, skipped={}",
            summary.copied, summary.updated, summary.skipped
        ));
        sink.status(format!("Sync {}", outcome.status));
        info!(status = %outcome.status, code = outcome.code(), "sync finished");
        sink.send(SyncEvent::Finished(outcome.clone()));
        outcome
    }

    async fn run_phases(&self, config: &SyncConfig, session: &mut SyncSession) -> Result<(), Halt> {
        config.validate()?;

        self.enter(session, Phase::Scanning)?;
        let library = open_index(config.library_index.as_deref(), "library", session).await;
        let device = open_index(config.device_index.as_deref(), "device", session).await;
        if config.scan_first {
            if let Some(index) = &library {
                self.scan(index, &config.source_root, RootKind::Library, session).await?;
            }
            if let Some(index) = &device
                && config.dest_root.is_dir()
            {
                self.scan(index, &config.dest_root, RootKind::Device, session).await?;
            }
        }

        self.enter(session, Phase::Planning)?;
        let selection = self.selection(config, library.as_ref(), device.as_ref()).await?;
        let request = PlanRequest {
            source_root: &config.source_root,
            dest_root: &config.dest_root,
            selection,
            extensions: &config.extensions,
            skip_existing: config.skip_existing,
            fallback_dir: &config.fallback_dir,
        };
        let source_cache = FingerprintCache::from_option(library.clone());

        if config.verify_only {
            return self.verify_only(config, &request, source_cache, session).await;
        }

        let planner = SyncPlanner::new(source_cache, FingerprintCache::from_option(device.clone()));
        let plan = planner.plan(&request, session.cancel_token()).await?;
        self.announce_plan(config, &plan, session);

        self.enter(session, Phase::Copying)?;
        self.copy_all(config, &plan, session).await?;

        self.enter(session, Phase::Verifying)?;
        if config.verify {
            let targets = self.verify_targets(config, session);
            let copier = CopyEngine::new(config.chunk_bytes);
            let report = Verifier::new(planner.source_cache(), planner.dest_cache(), copier, config.auto_repair)
                .verify(&targets, session)
                .await;
            record_verification(report, session);
        }

        if config.delete_extras {
            if let Some(reason) = prune_blocker(&plan) {
                warn!(unreadable = plan.unreadable_dirs.len(), "source listing incomplete, not pruning");
                session.events.notice(reason);
            } else {
                self.enter(session, Phase::Pruning)?;
                let report = Pruner::new(&config.dest_root, &config.extensions, config.prune_to_trash)
                    .prune(&plan.scope, &plan.planned_relative, session)
                    .await;
                session.summary.deleted = report.deleted;
                session.summary.delete_failed = report.failed;
            }
        }

        if config.transform.is_some() {
            self.enter(session, Phase::Transforming)?;
            self.transform_touched(config, session).await;
        }

        self.enter(session, Phase::IndexingDestination)?;
        self.reindex_destination(config, device, session).await;
        Ok(())
    }

    fn enter(&self, session: &mut SyncSession, phase: Phase) -> Result<(), Halt> {
        if session.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        info!(phase = %phase, "entering phase");
        session.events.status(format!("{phase}..."));
        Ok(())
    }

    async fn scan(
        &self,
        index: &IndexStore,
        root: &Path,
        kind: RootKind,
        session: &mut SyncSession,
    ) -> Result<(), Halt> {
        let scanner = IndexScanner::new(index.clone(), self.extractor.clone());
        match scanner.scan(root, kind, session.cancel_token()).await {
            Ok(outcome) => {
                let s = outcome.summary;
                session.events.log(format!(
                    "Indexed {}: {} seen, {} updated, {} removed",
                    root.display(),
                    s.seen,
                    s.updated,
                    s.deleted
                ));
                Ok(())
            }
            Err(ScanError::Cancelled) => Err(Halt::Cancelled),
            Err(err) => {
                warn!(root = %root.display(), error = %err, "scan failed, continuing with stored index");
                session.events.notice(format!("Could not index {}: {err}", root.display()));
                Ok(())
            }
        }
    }

    async fn selection(
        &self,
        config: &SyncConfig,
        library: Option<&IndexStore>,
        device: Option<&IndexStore>,
    ) -> Result<Selection, Halt> {
        Ok(match &config.mode {
            SyncMode::Full => Selection::Whole,
            SyncMode::Partial(_) => Selection::Subtrees(config.resolved_selections()?),
            SyncMode::AddMissing => {
                let source_rows = match library {
                    Some(index) => rows_or_live(index.all().await, &config.source_root, self, config).await,
                    None => self.live_rows(&config.source_root, config).await,
                };
                let dest_rows = match device {
                    Some(index) => {
                        rows_or_live(index.all_under(&config.dest_root).await, &config.dest_root, self, config)
                            .await
                    }
                    None => self.live_rows(&config.dest_root, config).await,
                };
                Selection::Identity {
                    source_rows,
                    dest_rows,
                }
            }
        })
    }

    async fn live_rows(&self, root: &Path, config: &SyncConfig) -> Vec<TrackRecord> {
        match snapshot_live(root, self.extractor.clone(), &config.extensions).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "live listing failed");
                Vec::new()
            }
        }
    }

    fn announce_plan(&self, config: &SyncConfig, plan: &SyncPlan, session: &mut SyncSession) {
        session.summary.planned = plan.entries.len() as u64;
        session.summary.skipped += plan.identical;
        session.events.log(format!(
            "Planned {} files ({}), {} already identical",
            plan.entries.len(),
            human_bytes(plan.total_bytes),
            plan.identical
        ));
        debug!(total_bytes = plan.total_bytes, unreadable = plan.unreadable, "plan ready");
        for dir in &plan.unreadable_dirs {
            let rel = dir.strip_prefix(&config.source_root).unwrap_or(dir);
            session.events.error(&rel.to_string_lossy(), "folder could not be read");
            session.summary.failed += 1;
        }

        if let Some(free) = free_bytes(&config.dest_root)
            && plan.total_bytes > free
        {
            session.events.notice(format!(
                "Not enough free space on destination: need {}, {} available",
                human_bytes(plan.total_bytes),
                human_bytes(free)
            ));
        }
    }

    async fn copy_all(&self, config: &SyncConfig, plan: &SyncPlan, session: &mut SyncSession) -> Result<(), Halt> {
        if plan.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&config.dest_root)
            .await
            .map_err(|err| Halt::Fatal(format!("cannot create {}: {err}", config.dest_root.display())))?;

        let copier = CopyEngine::new(config.chunk_bytes);
        session.set_planned(plan.total_bytes);
        for entry in &plan.entries {
            if session.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let rel = entry.relative.to_string_lossy();
            match copier.copy(entry, session).await {
                Ok(CopyOutcome::Written { resumed, replaced, .. }) => {
                    if resumed || replaced {
                        session.summary.updated += 1;
                        session.events.resumed(&rel);
                    } else {
                        session.summary.copied += 1;
                        session.events.added(&rel);
                    }
                }
                Ok(CopyOutcome::AlreadyComplete) => {
                    debug!(path = %rel, "destination assumed complete");
                    session.summary.skipped += 1;
                }
                Ok(CopyOutcome::Cancelled { .. }) => return Err(Halt::Cancelled),
                Err(err) => {
                    warn!(path = %rel, error = %err, "copy failed");
                    session.events.error(&rel, &err);
                    session.summary.failed += 1;
                }
            }
        }
        session.finish_progress();
        Ok(())
    }

    fn verify_targets(&self, config: &SyncConfig, session: &SyncSession) -> Vec<VerifyTarget> {
        let pipeline = self.transform.as_ref().filter(|_| config.transform.is_some());
        session
            .touched()
            .iter()
            .chain(session.assumed_complete())
            .filter(|dest| pipeline.is_none_or(|p| !p.recognizes(dest)))
            .filter_map(|dest| {
                let source = session.source_for(dest)?;
                let relative = dest.strip_prefix(&config.dest_root).unwrap_or(dest);
                Some(VerifyTarget {
                    source: source.to_path_buf(),
                    dest: dest.clone(),
                    relative: relative.to_path_buf(),
                })
            })
            .collect()
    }

    async fn verify_only(
        &self,
        config: &SyncConfig,
        request: &PlanRequest<'_>,
        source_cache: FingerprintCache,
        session: &mut SyncSession,
    ) -> Result<(), Halt> {
        let planner = SyncPlanner::new(source_cache, FingerprintCache::uncached());
        let targets: Vec<VerifyTarget> = planner
            .candidates(request)
            .await?
            .into_iter()
            .filter(|candidate| candidate.dest.is_file())
            .map(|candidate| VerifyTarget {
                source: candidate.source,
                dest: candidate.dest,
                relative: candidate.relative,
            })
            .collect();
        session.events.log(format!("Verifying {} files on destination", targets.len()));

        self.enter(session, Phase::Verifying)?;
        let copier = CopyEngine::new(config.chunk_bytes);
        let report = Verifier::new(planner.source_cache(), planner.dest_cache(), copier, config.auto_repair)
            .verify(&targets, session)
            .await;
        record_verification(report, session);
        Ok(())
    }

    async fn transform_touched(&self, config: &SyncConfig, session: &mut SyncSession) {
        let (Some(params), Some(pipeline)) = (config.transform, self.transform.clone()) else {
            debug!("no transform pipeline configured");
            return;
        };
        let files = session.touched().to_vec();
        if files.is_empty() {
            return;
        }
        let result = tokio::task::spawn_blocking(move || pipeline.apply(&files, &params)).await;
        match result {
            Ok(Ok(altered)) => {
                session.events.log(format!("Transformed {} files", altered.len()));
                session.record_transformed(altered);
            }
            Ok(Err(failure)) => {
                warn!(error = %failure.error, altered = failure.altered.len(), "transform failed");
                session.events.notice(format!(
                    "Transform failed after {} files: {}",
                    failure.altered.len(),
                    failure.error
                ));
                session.record_transformed(failure.altered);
            }
            Err(err) => {
                warn!(error = %err, "transform task failed");
                session.events.notice(format!("Transform failed: {err}"));
            }
        }
    }

    async fn reindex_destination(
        &self,
        config: &SyncConfig,
        device: Option<IndexStore>,
        session: &mut SyncSession,
    ) {
        if let Some(index) = device
            && config.dest_root.is_dir()
        {
            let scanner = IndexScanner::new(index.clone(), self.extractor.clone());
            match scanner
                .scan(&config.dest_root, RootKind::Device, session.cancel_token())
                .await
            {
                Ok(outcome) if !outcome.deferred.is_empty() => {
                    debug!(deferred = outcome.deferred.len(), "starting destination hash backfill");
                    session.events.status("Fingerprinting device files");
                    let cancel = session.cancel_token().clone();
                    match spawn_backfill(index, outcome.deferred, cancel).await {
                        Ok(backfill) => info!(
                            hashed = backfill.hashed,
                            skipped = backfill.skipped,
                            failed = backfill.failed,
                            cancelled = backfill.cancelled,
                            "destination hash backfill finished"
                        ),
                        Err(err) => warn!(error = %err, "destination hash backfill aborted"),
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "destination rescan failed"),
            }
        }
        session
            .events
            .send(SyncEvent::ReindexDestination(config.dest_root.clone()));
    }
}

async fn open_index(path: Option<&Path>, label: &str, session: &mut SyncSession) -> Option<IndexStore> {
    let path = path?;
    match IndexStore::open(path).await {
        Ok(index) => Some(index),
        Err(err) => {
            warn!(index = label, path = %path.display(), error = %err, "index unavailable");
            session.events.notice(format!(
                "The {label} index is unavailable ({err}); comparing live files instead"
            ));
            None
        }
    }
}

async fn rows_or_live(
    rows: Result<Vec<TrackRecord>, IndexError>,
    root: &Path,
    engine: &SyncEngine,
    config: &SyncConfig,
) -> Vec<TrackRecord> {
    match rows {
        Ok(rows) => rows,
        Err(err) => {
            warn!(root = %root.display(), error = %err, "index read failed, listing live files");
            engine.live_rows(root, config).await
        }
    }
}

fn record_verification(report: VerifyReport, session: &mut SyncSession) {
    session.summary.verified = report.checked;
    session.summary.mismatches = report.mismatches;
    session.summary.auto_repaired = report.auto_repaired;
    session.summary.failed_repairs = report.failed_repairs;
    session.summary.failed += report.errors;
    if report.mismatches > 0 {
        session.events.notice(format!(
            "Verification found {} mismatched files: {} repaired, {} failed",
            report.mismatches, report.auto_repaired, report.failed_repairs
        ));
    }
}

/// Pruning needs the complete source listing; returns the notice to show
/// when it is not.
fn prune_blocker(plan: &SyncPlan) -> Option<String> {
    let first = plan.unreadable_dirs.first()?;
    Some(format!(
        "Not removing extra files: {} source folder(s) could not be read, starting with {}",
        plan.unreadable_dirs.len(),
        first.display()
    ))
}

fn free_bytes(dest_root: &Path) -> Option<u64> {
    let existing = dest_root.ancestors().find(|p| p.exists())?;
    disk_usage(existing).ok().map(|(_, free)| free)
}

fn registry_key(dest_root: &Path) -> PathBuf {
    std::fs::canonicalize(dest_root).unwrap_or_else(|_| dest_root.to_path_buf())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
