use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metadata::{MetadataExtractor, TrackTags};

use super::hash::{FileStamp, file_md5};
use super::index::{IndexError, IndexStore, TrackRecord};
use super::paths::{ExtensionFilter, walk_files};

pub const DEFAULT_SCAN_EXTENSIONS: &[&str] =
    &["flac", "mp3", "m4a", "alac", "aac", "ogg", "opus", "wav"];
pub const BACKFILL_COMMIT_EVERY: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// Hashes are computed during the scan.
    Library,
    /// Hashes are deferred to a background backfill.
    Device,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan root {0} is not a directory")]
    MissingRoot(PathBuf),
    #[error("scan cancelled")]
    Cancelled,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub seen: u64,
    pub updated: u64,
    pub deleted: u64,
    pub failed: u64,
    pub deferred: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub summary: ScanSummary,
    /// Device files still waiting for a fingerprint.
    pub deferred: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub hashed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// Reconciles one index store with the files under its root.
#[derive(Clone)]
pub struct IndexScanner {
    index: IndexStore,
    extractor: Arc<dyn MetadataExtractor>,
    extensions: ExtensionFilter,
}

impl IndexScanner {
    pub fn new(index: IndexStore, extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self {
            index,
            extractor,
            extensions: ExtensionFilter::new(DEFAULT_SCAN_EXTENSIONS),
        }
    }

    pub fn with_extensions(mut self, extensions: ExtensionFilter) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub async fn scan(
        &self,
        root: &Path,
        kind: RootKind,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::MissingRoot(root.to_path_buf()));
        }
        let files = walk_files(root, &self.extensions).await?;
        let mut outcome = ScanOutcome::default();
        let mut present: HashSet<String> = HashSet::with_capacity(files.len());

        for path in files {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let key = path.to_string_lossy().into_owned();
            present.insert(key.clone());
            outcome.summary.seen += 1;

            let stamp = match FileStamp::read(&path).await {
                Ok(stamp) => stamp,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "stat failed, skipping");
                    outcome.summary.failed += 1;
                    continue;
                }
            };

            let existing = self.index.lookup(&key).await?;
            if let Some(record) = existing
                && record.stamp() == stamp
            {
                if kind == RootKind::Device && record.trusted_hash(stamp).is_none() {
                    outcome.deferred.push(path);
                }
                continue;
            }

            let tags = self.extract(&path).await;
            let mut record = TrackRecord::from_tags(&path, tags, stamp);
            match kind {
                RootKind::Library => match file_md5(&path).await {
                    Ok(hash) => record.content_hash = Some(hash),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "hashing failed, skipping");
                        outcome.summary.failed += 1;
                        continue;
                    }
                },
                RootKind::Device => outcome.deferred.push(path.clone()),
            }

            self.index.upsert(&record).await?;
            debug!(path = %path.display(), "indexed");
            outcome.summary.updated += 1;
        }

        for record in self.index.all_under(root).await? {
            if present.contains(&record.path) {
                continue;
            }
            let path = Path::new(&record.path);
            if tokio::fs::try_exists(path).await.unwrap_or(true) {
                continue;
            }
            self.index.delete(&record.path).await?;
            debug!(path = %record.path, "removed vanished track");
            outcome.summary.deleted += 1;
        }

        outcome.summary.deferred = outcome.deferred.len() as u64;
        info!(
            root = %root.display(),
            seen = outcome.summary.seen,
            updated = outcome.summary.updated,
            deleted = outcome.summary.deleted,
            failed = outcome.summary.failed,
            deferred = outcome.summary.deferred,
            "scan complete"
        );
        Ok(outcome)
    }

    async fn extract(&self, path: &Path) -> TrackTags {
        extract_blocking(self.extractor.clone(), path).await
    }
}

async fn extract_blocking(extractor: Arc<dyn MetadataExtractor>, path: &Path) -> TrackTags {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || extractor.extract(&owned)).await {
        Ok(tags) => tags,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "extractor panicked, using defaults");
            TrackTags::fallback(path)
        }
    }
}

/// Hashes deferred device files in the background, committing every
/// [`BACKFILL_COMMIT_EVERY`] results. Files that changed since they were
/// indexed are left for the next scan.
pub fn spawn_backfill(
    index: IndexStore,
    paths: Vec<PathBuf>,
    cancel: CancellationToken,
) -> JoinHandle<BackfillSummary> {
    tokio::spawn(async move {
        let mut summary = BackfillSummary::default();
        let mut batch: Vec<(String, String)> = Vec::with_capacity(BACKFILL_COMMIT_EVERY);

        for path in paths {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let key = path.to_string_lossy().into_owned();
            let current = match FileStamp::read(&path).await {
                Ok(stamp) => stamp,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "backfill stat failed");
                    summary.failed += 1;
                    continue;
                }
            };
            let indexed = match index.lookup(&key).await {
                Ok(Some(record)) => record.stamp() == current,
                Ok(None) => false,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "backfill lookup failed");
                    summary.failed += 1;
                    continue;
                }
            };
            if !indexed {
                summary.skipped += 1;
                continue;
            }
            match file_md5(&path).await {
                Ok(hash) => batch.push((key, hash)),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "backfill hashing failed");
                    summary.failed += 1;
                    continue;
                }
            }
            if batch.len() >= BACKFILL_COMMIT_EVERY {
                commit_batch(&index, &mut batch, &mut summary).await;
            }
        }
        commit_batch(&index, &mut batch, &mut summary).await;
        info!(
            hashed = summary.hashed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "hash backfill finished"
        );
        summary
    })
}

async fn commit_batch(
    index: &IndexStore,
    batch: &mut Vec<(String, String)>,
    summary: &mut BackfillSummary,
) {
    if batch.is_empty() {
        return;
    }
    match index.set_hashes(batch).await {
        Ok(()) => summary.hashed += batch.len() as u64,
        Err(err) => {
            warn!(error = %err, count = batch.len(), "failed to commit backfill batch");
            summary.failed += batch.len() as u64;
        }
    }
    batch.clear();
}

/// Builds records straight from the filesystem, for runs without a usable
/// index. No fingerprints are computed.
pub async fn snapshot_live(
    root: &Path,
    extractor: Arc<dyn MetadataExtractor>,
    filter: &ExtensionFilter,
) -> Result<Vec<TrackRecord>, ScanError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for path in walk_files(root, filter).await? {
        let stamp = match FileStamp::read(&path).await {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stat failed, skipping");
                continue;
            }
        };
        let tags = extract_blocking(extractor.clone(), &path).await;
        out.push(TrackRecord::from_tags(&path, tags, stamp));
    }
    Ok(out)
}
