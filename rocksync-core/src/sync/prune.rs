use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::paths::{ExtensionFilter, mirror_path_for, relative_to, walk_files};
use super::planner::PruneScope;
use super::session::SyncSession;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: u64,
    pub failed: u64,
}

/// Removes destination files that have no counterpart in the planned source
/// set. Only files with an allowed extension inside the scope are considered.
pub struct Pruner<'a> {
    dest_root: &'a Path,
    extensions: &'a ExtensionFilter,
    to_trash: bool,
}

impl<'a> Pruner<'a> {
    pub fn new(dest_root: &'a Path, extensions: &'a ExtensionFilter, to_trash: bool) -> Self {
        Self {
            dest_root,
            extensions,
            to_trash,
        }
    }

    pub async fn prune(
        &self,
        scope: &PruneScope,
        planned: &HashSet<PathBuf>,
        session: &mut SyncSession,
    ) -> PruneReport {
        let mut report = PruneReport::default();
        let files = match self.scoped_files(scope).await {
            Ok(files) => files,
            Err(err) => {
                warn!(root = %self.dest_root.display(), error = %err, "cannot list destination for pruning");
                session.events.error("prune", err);
                report.failed += 1;
                return report;
            }
        };

        for path in files {
            if session.is_cancelled() {
                break;
            }
            let Ok(rel) = relative_to(self.dest_root, &path) else {
                continue;
            };
            if planned.contains(&rel) {
                continue;
            }
            let shown = rel.to_string_lossy();
            match self.remove(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "pruned");
                    session.events.deleted(&shown);
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "prune failed");
                    session.events.log(format!("! del {shown}: {err}"));
                    report.failed += 1;
                }
            }
        }

        info!(deleted = report.deleted, failed = report.failed, "pruning finished");
        report
    }

    async fn scoped_files(&self, scope: &PruneScope) -> io::Result<Vec<PathBuf>> {
        match scope {
            PruneScope::Disabled => Ok(Vec::new()),
            PruneScope::Everything => {
                if !self.dest_root.is_dir() {
                    return Ok(Vec::new());
                }
                walk_files(self.dest_root, self.extensions).await
            }
            PruneScope::Subtrees(roots) => {
                let mut out = Vec::new();
                for rel in roots {
                    let Ok(path) = mirror_path_for(self.dest_root, rel) else {
                        continue;
                    };
                    if path.is_dir() {
                        out.extend(walk_files(&path, self.extensions).await?);
                    } else if path.is_file() && self.extensions.admits(&path) {
                        out.push(path);
                    }
                }
                Ok(out)
            }
        }
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        if !self.to_trash {
            return tokio::fs::remove_file(path).await;
        }
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || trash::delete(owned)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(io::Error::other(err.to_string())),
            Err(err) => Err(io::Error::other(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSink, SyncEvent};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn layout(root: &Path) {
        for rel in ["A/keep.mp3", "A/extra.mp3", "AB/other.mp3", "A/cover.jpg", "top.mp3"] {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, rel).unwrap();
        }
    }

    #[tokio::test]
    async fn subtree_scope_never_leaves_selection() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        layout(root);

        let (sink, mut rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let planned: HashSet<PathBuf> = [PathBuf::from("A/keep.mp3")].into_iter().collect();
        let ext = ExtensionFilter::new(["mp3"]);

        let report = Pruner::new(root, &ext, false)
            .prune(
                &PruneScope::Subtrees(vec![PathBuf::from("A")]),
                &planned,
                &mut session,
            )
            .await;

        assert_eq!(report, PruneReport { deleted: 1, failed: 0 });
        assert!(!root.join("A/extra.mp3").exists());
        assert!(root.join("A/keep.mp3").exists());
        assert!(root.join("A/cover.jpg").exists());
        assert!(root.join("AB/other.mp3").exists());
        assert!(root.join("top.mp3").exists());
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::Log("- A/extra.mp3".into()));
    }

    #[tokio::test]
    async fn full_scope_removes_everything_unplanned() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        layout(root);

        let (sink, _rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let planned: HashSet<PathBuf> = [PathBuf::from("top.mp3")].into_iter().collect();
        let ext = ExtensionFilter::new(["mp3"]);

        let report = Pruner::new(root, &ext, false)
            .prune(&PruneScope::Everything, &planned, &mut session)
            .await;

        assert_eq!(report.deleted, 3);
        assert!(root.join("top.mp3").exists());
        assert!(root.join("A/cover.jpg").exists());
    }

    #[tokio::test]
    async fn disabled_scope_touches_nothing() {
        let dir = tempdir().unwrap();
        layout(dir.path());
        let (sink, _rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let ext = ExtensionFilter::default();

        let report = Pruner::new(dir.path(), &ext, false)
            .prune(&PruneScope::Disabled, &HashSet::new(), &mut session)
            .await;
        assert_eq!(report, PruneReport::default());
        assert!(dir.path().join("A/extra.mp3").exists());
    }
}
