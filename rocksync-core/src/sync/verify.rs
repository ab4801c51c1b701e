use std::path::PathBuf;

use tracing::{info, warn};

use super::hash::FingerprintCache;
use super::session::SyncSession;
use super::transfer::{CopyEngine, CopyOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyTarget {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub relative: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: u64,
    pub mismatches: u64,
    pub auto_repaired: u64,
    pub failed_repairs: u64,
    pub errors: u64,
}

/// Compares destination fingerprints against their sources, re-copying a
/// mismatching file at most once.
pub struct Verifier<'a> {
    source: &'a FingerprintCache,
    dest: &'a FingerprintCache,
    copier: CopyEngine,
    auto_repair: bool,
}

impl<'a> Verifier<'a> {
    pub fn new(
        source: &'a FingerprintCache,
        dest: &'a FingerprintCache,
        copier: CopyEngine,
        auto_repair: bool,
    ) -> Self {
        Self {
            source,
            dest,
            copier,
            auto_repair,
        }
    }

    pub async fn verify(&self, targets: &[VerifyTarget], session: &mut SyncSession) -> VerifyReport {
        let mut report = VerifyReport::default();
        for target in targets {
            if session.is_cancelled() {
                break;
            }
            let rel = target.relative.to_string_lossy();

            let expected = match self.source.fingerprint(&target.source).await {
                Ok(hash) => hash,
                Err(err) => {
                    session.events.error(&rel, format!("cannot hash source: {err}"));
                    report.errors += 1;
                    continue;
                }
            };
            let actual = match self.dest.refresh(&target.dest).await {
                Ok(hash) => hash,
                Err(err) => {
                    session.events.error(&rel, format!("cannot hash destination: {err}"));
                    report.errors += 1;
                    continue;
                }
            };
            report.checked += 1;
            if actual == expected {
                continue;
            }

            report.mismatches += 1;
            warn!(path = %target.dest.display(), "checksum mismatch");
            if !self.auto_repair {
                session.events.error(&rel, "checksum mismatch");
                report.failed_repairs += 1;
                continue;
            }

            if self.repair(target, &expected, session).await {
                session.events.log(format!("~ {rel} (repaired)"));
                report.auto_repaired += 1;
            } else {
                session.events.error(&rel, "checksum mismatch after repair");
                report.failed_repairs += 1;
            }
        }

        info!(
            checked = report.checked,
            mismatches = report.mismatches,
            auto_repaired = report.auto_repaired,
            failed_repairs = report.failed_repairs,
            "verification finished"
        );
        report
    }

    async fn repair(&self, target: &VerifyTarget, expected: &str, session: &mut SyncSession) -> bool {
        match self
            .copier
            .copy_from_scratch(&target.source, &target.dest, session)
            .await
        {
            Ok(CopyOutcome::Written { .. }) => {}
            Ok(_) => return false,
            Err(err) => {
                warn!(path = %target.dest.display(), error = %err, "repair copy failed");
                return false;
            }
        }
        matches!(self.dest.refresh(&target.dest).await, Ok(hash) if hash == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSink, SyncEvent};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn target(src: &Path, dst: &Path) -> VerifyTarget {
        VerifyTarget {
            source: src.to_path_buf(),
            dest: dst.to_path_buf(),
            relative: PathBuf::from(dst.file_name().unwrap()),
        }
    }

    #[tokio::test]
    async fn repairs_same_size_corruption() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.flac");
        let dst = dir.path().join("b.flac");
        std::fs::write(&src, b"good bytes").unwrap();
        std::fs::write(&dst, b"evil bytes").unwrap();

        let (sink, mut rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let cache = FingerprintCache::uncached();
        let report = Verifier::new(&cache, &cache, CopyEngine::default(), true)
            .verify(&[target(&src, &dst)], &mut session)
            .await;

        assert_eq!(report.checked, 1);
        assert_eq!(report.mismatches, 1);
        assert_eq!(report.auto_repaired, 1);
        assert_eq!(report.failed_repairs, 0);
        assert_eq!(std::fs::read(&dst).unwrap(), b"good bytes");

        let mut saw_repair = false;
        while let Ok(event) = rx.try_recv() {
            if event == SyncEvent::Log("~ b.flac (repaired)".into()) {
                saw_repair = true;
            }
        }
        assert!(saw_repair);
    }

    #[tokio::test]
    async fn mismatch_without_auto_repair_is_failed_repair() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.flac");
        let dst = dir.path().join("b.flac");
        std::fs::write(&src, b"good").unwrap();
        std::fs::write(&dst, b"evil").unwrap();

        let (sink, _rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let cache = FingerprintCache::uncached();
        let report = Verifier::new(&cache, &cache, CopyEngine::default(), false)
            .verify(&[target(&src, &dst)], &mut session)
            .await;

        assert_eq!(report.mismatches, 1);
        assert_eq!(report.failed_repairs, 1);
        assert_eq!(std::fs::read(&dst).unwrap(), b"evil");
    }

    #[tokio::test]
    async fn missing_destination_counts_as_error() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.flac");
        std::fs::write(&src, b"good").unwrap();

        let (sink, _rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        let cache = FingerprintCache::uncached();
        let report = Verifier::new(&cache, &cache, CopyEngine::default(), true)
            .verify(&[target(&src, &dir.path().join("gone.flac"))], &mut session)
            .await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.checked, 0);
    }
}
