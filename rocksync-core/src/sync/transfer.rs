use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::hash::{HASH_CHUNK_BYTES, file_md5, prefix_md5};
use super::planner::SyncPlanEntry;
use super::session::SyncSession;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("cannot read source {path}: {source}")]
    Source { path: PathBuf, source: io::Error },
    #[error("cannot write destination {path}: {source}")]
    Destination { path: PathBuf, source: io::Error },
}

/// How a copy begins, decided from the destination as found at copy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStart {
    Fresh,
    Complete,
    Rewrite,
    Append(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Written {
        bytes: u64,
        resumed: bool,
        replaced: bool,
    },
    AlreadyComplete,
    Cancelled {
        bytes: u64,
    },
}

pub fn decide_start(bytes_remaining: u64, source_size: u64, dest_size: Option<u64>) -> CopyStart {
    let Some(dest_size) = dest_size else {
        return CopyStart::Fresh;
    };
    if bytes_remaining == 0 {
        return CopyStart::Complete;
    }
    if bytes_remaining >= source_size {
        return CopyStart::Rewrite;
    }
    if dest_size >= source_size {
        return CopyStart::Complete;
    }
    CopyStart::Append(dest_size)
}

/// Streams one file at a time in fixed-size chunks, resuming partial
/// destinations.
#[derive(Debug, Clone, Copy)]
pub struct CopyEngine {
    chunk_size: usize,
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self::new(HASH_CHUNK_BYTES)
    }
}

impl CopyEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn copy(
        &self,
        entry: &SyncPlanEntry,
        session: &mut SyncSession,
    ) -> Result<CopyOutcome, CopyError> {
        let source_size = tokio::fs::metadata(&entry.source_path)
            .await
            .map_err(|source| CopyError::Source {
                path: entry.source_path.clone(),
                source,
            })?
            .len();
        let dest_size = match tokio::fs::metadata(&entry.dest_path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        let mut start = decide_start(entry.bytes_remaining, source_size, dest_size);
        if let CopyStart::Append(offset) = start
            && !self.prefix_matches(&entry.source_path, &entry.dest_path, offset).await
        {
            debug!(path = %entry.relative.display(), "partial destination diverges, rewriting");
            start = CopyStart::Rewrite;
        }
        // The source changed since planning; a stale skip decision is void.
        if start == CopyStart::Complete && source_size != entry.source_size {
            start = CopyStart::Rewrite;
        }

        match start {
            CopyStart::Complete => {
                session.mark_assumed_complete(&entry.dest_path, &entry.source_path);
                Ok(CopyOutcome::AlreadyComplete)
            }
            CopyStart::Fresh | CopyStart::Rewrite => {
                let outcome = self
                    .stream(&entry.source_path, &entry.dest_path, 0, session)
                    .await?;
                Ok(self.finish(entry, outcome, false, start == CopyStart::Rewrite, session).await)
            }
            CopyStart::Append(offset) => {
                let outcome = self
                    .stream(&entry.source_path, &entry.dest_path, offset, session)
                    .await?;
                Ok(self.finish(entry, outcome, true, false, session).await)
            }
        }
    }

    /// Rewrites `dest` from the first byte of `source`.
    pub async fn copy_from_scratch(
        &self,
        source: &Path,
        dest: &Path,
        session: &mut SyncSession,
    ) -> Result<CopyOutcome, CopyError> {
        let outcome = self.stream(source, dest, 0, session).await?;
        if let CopyOutcome::Written { .. } = outcome {
            copy_attributes(source, dest).await;
            session.mark_touched(dest, source);
        }
        Ok(outcome)
    }

    async fn finish(
        &self,
        entry: &SyncPlanEntry,
        outcome: CopyOutcome,
        resumed: bool,
        replaced: bool,
        session: &mut SyncSession,
    ) -> CopyOutcome {
        match outcome {
            CopyOutcome::Written { bytes, .. } => {
                copy_attributes(&entry.source_path, &entry.dest_path).await;
                session.mark_touched(&entry.dest_path, &entry.source_path);
                CopyOutcome::Written {
                    bytes,
                    resumed,
                    replaced,
                }
            }
            other => other,
        }
    }

    async fn prefix_matches(&self, source: &Path, dest: &Path, len: u64) -> bool {
        match (prefix_md5(source, len).await, file_md5(dest).await) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    async fn stream(
        &self,
        source: &Path,
        dest: &Path,
        offset: u64,
        session: &mut SyncSession,
    ) -> Result<CopyOutcome, CopyError> {
        let source_err = |err| CopyError::Source {
            path: source.to_path_buf(),
            source: err,
        };
        let dest_err = |err| CopyError::Destination {
            path: dest.to_path_buf(),
            source: err,
        };

        let mut reader = tokio::fs::File::open(source).await.map_err(source_err)?;
        if offset > 0 {
            reader
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(source_err)?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(dest_err)?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        if offset > 0 {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let mut writer = options.open(dest).await.map_err(dest_err)?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            if session.is_cancelled() {
                writer.flush().await.map_err(dest_err)?;
                return Ok(CopyOutcome::Cancelled { bytes: written });
            }
            let read = reader.read(&mut buf).await.map_err(source_err)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await.map_err(dest_err)?;
            written += read as u64;
            session.add_done(read as u64);
        }

        writer.flush().await.map_err(dest_err)?;
        writer.sync_all().await.map_err(dest_err)?;
        Ok(CopyOutcome::Written {
            bytes: written,
            resumed: offset > 0,
            replaced: false,
        })
    }
}

/// Carries the source modification time and, for writable sources, the
/// permission bits. Failures are logged only.
pub async fn copy_attributes(source: &Path, dest: &Path) {
    let meta = match tokio::fs::metadata(source).await {
        Ok(meta) => meta,
        Err(err) => {
            warn!(path = %source.display(), error = %err, "cannot read source attributes");
            return;
        }
    };

    let permissions = meta.permissions();
    if !permissions.readonly()
        && let Err(err) = tokio::fs::set_permissions(dest, permissions).await
    {
        debug!(path = %dest.display(), error = %err, "cannot copy permissions");
    }

    let Ok(modified) = meta.modified() else {
        return;
    };
    let dest = dest.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&dest)?;
        file.set_modified(modified)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "cannot copy modification time"),
        Err(err) => debug!(error = %err, "modification time task failed"),
    }
}
