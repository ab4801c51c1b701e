use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hash::FingerprintCache;
use super::index::TrackRecord;
use super::paths::{ExtensionFilter, PathError, mirror_path_for, relative_to, walk_tree};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot enumerate {path}: {source}")]
    Enumerate { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("planning cancelled")]
    Cancelled,
}

/// Which source files a run considers.
#[derive(Debug, Clone)]
pub enum Selection {
    Whole,
    /// Top-level subtrees relative to the source root.
    Subtrees(Vec<PathBuf>),
    /// Track-identity comparison between the two indexes.
    Identity {
        source_rows: Vec<TrackRecord>,
        dest_rows: Vec<TrackRecord>,
    },
}

#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub source_root: &'a Path,
    pub dest_root: &'a Path,
    pub selection: Selection,
    pub extensions: &'a ExtensionFilter,
    pub skip_existing: bool,
    pub fallback_dir: &'a str,
}

/// Where pruning may look for extraneous files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneScope {
    Everything,
    Subtrees(Vec<PathBuf>),
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub relative: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlanEntry {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub relative: PathBuf,
    pub source_size: u64,
    pub bytes_remaining: u64,
}

#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub entries: Vec<SyncPlanEntry>,
    pub total_bytes: u64,
    pub identical: u64,
    pub unreadable: u64,
    /// Source directories that could not be listed; their files are missing
    /// from `planned_relative`.
    pub unreadable_dirs: Vec<PathBuf>,
    pub planned_relative: HashSet<PathBuf>,
    pub scope: PruneScope,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every selected source file made it into `planned_relative`.
    pub fn is_complete(&self) -> bool {
        self.unreadable_dirs.is_empty()
    }
}

/// Normalized `(artist, album, title, duration)` identity of a track.
pub type TrackKey = (String, String, String, i64);

pub fn track_key(record: &TrackRecord) -> Option<TrackKey> {
    let artist = fold(&record.artist);
    let album = fold(&record.album);
    let title = fold(&record.title);
    if artist.is_empty() && album.is_empty() && title.is_empty() {
        return None;
    }
    Some((artist, album, title, record.duration_seconds))
}

fn fold(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct SyncPlanner {
    source: FingerprintCache,
    dest: FingerprintCache,
}

impl SyncPlanner {
    pub fn new(source: FingerprintCache, dest: FingerprintCache) -> Self {
        Self { source, dest }
    }

    pub fn source_cache(&self) -> &FingerprintCache {
        &self.source
    }

    pub fn dest_cache(&self) -> &FingerprintCache {
        &self.dest
    }

    /// Source files the request selects, paired with their mirrored
    /// destination paths.
    pub async fn candidates(&self, request: &PlanRequest<'_>) -> Result<Vec<Candidate>, PlanError> {
        Ok(self.gather(request).await?.0)
    }

    /// Candidates plus the source directories that could not be listed.
    async fn gather(
        &self,
        request: &PlanRequest<'_>,
    ) -> Result<(Vec<Candidate>, Vec<PathBuf>), PlanError> {
        let mut unreadable = Vec::new();
        let candidates = match &request.selection {
            Selection::Whole => {
                self.walk_candidates(request, request.source_root.to_path_buf(), &mut unreadable)
                    .await?
            }
            Selection::Subtrees(roots) => {
                let mut out = Vec::new();
                for rel in roots {
                    let path = mirror_path_for(request.source_root, rel)?;
                    if path.is_dir() {
                        out.extend(self.walk_candidates(request, path, &mut unreadable).await?);
                    } else if path.is_file() && request.extensions.admits(&path) {
                        out.push(candidate_for(request, path, rel.clone())?);
                    } else {
                        warn!(selection = %rel.display(), "selected path is missing, skipping");
                    }
                }
                out
            }
            Selection::Identity {
                source_rows,
                dest_rows,
            } => identity_candidates(request, source_rows, dest_rows)?,
        };
        Ok((candidates, unreadable))
    }

    async fn walk_candidates(
        &self,
        request: &PlanRequest<'_>,
        start: PathBuf,
        unreadable: &mut Vec<PathBuf>,
    ) -> Result<Vec<Candidate>, PlanError> {
        let listing = walk_tree(&start, request.extensions)
            .await
            .map_err(|source| PlanError::Enumerate {
                path: start.clone(),
                source,
            })?;
        unreadable.extend(listing.unreadable_dirs);
        listing
            .files
            .into_iter()
            .map(|path| {
                let rel = relative_to(request.source_root, &path)?;
                candidate_for(request, path, rel)
            })
            .collect()
    }

    pub async fn plan(
        &self,
        request: &PlanRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SyncPlan, PlanError> {
        let scope = match &request.selection {
            Selection::Whole => PruneScope::Everything,
            Selection::Subtrees(roots) => PruneScope::Subtrees(roots.clone()),
            Selection::Identity { .. } => PruneScope::Disabled,
        };
        let (candidates, unreadable_dirs) = self.gather(request).await?;

        let mut plan = SyncPlan {
            entries: Vec::new(),
            total_bytes: 0,
            identical: 0,
            unreadable: 0,
            unreadable_dirs,
            planned_relative: HashSet::with_capacity(candidates.len()),
            scope,
        };

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(PlanError::Cancelled);
            }
            plan.planned_relative.insert(candidate.relative.clone());

            let source_size = match tokio::fs::metadata(&candidate.source).await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                Err(err) => {
                    warn!(path = %candidate.source.display(), error = %err, "source unreadable, skipping");
                    plan.unreadable += 1;
                    continue;
                }
            };

            let Some(bytes_remaining) = self
                .remaining_for(&candidate, source_size, request.skip_existing)
                .await
            else {
                debug!(path = %candidate.relative.display(), "identical, skipping");
                plan.identical += 1;
                continue;
            };

            plan.total_bytes += bytes_remaining;
            plan.entries.push(SyncPlanEntry {
                source_path: candidate.source,
                dest_path: candidate.dest,
                relative: candidate.relative,
                source_size,
                bytes_remaining,
            });
        }
        Ok(plan)
    }

    /// Bytes still to copy for one candidate, or `None` when the destination
    /// is already identical.
    async fn remaining_for(
        &self,
        candidate: &Candidate,
        source_size: u64,
        skip_existing: bool,
    ) -> Option<u64> {
        let dest_size = match tokio::fs::metadata(&candidate.dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Some(source_size),
        };

        if dest_size == source_size && self.identical(candidate).await {
            return None;
        }
        if dest_size < source_size {
            return Some(source_size - dest_size);
        }
        if skip_existing {
            return Some(0);
        }
        Some(source_size)
    }

    async fn identical(&self, candidate: &Candidate) -> bool {
        let source = match self.source.fingerprint(&candidate.source).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(path = %candidate.source.display(), error = %err, "cannot fingerprint source");
                return false;
            }
        };
        match self.dest.fingerprint(&candidate.dest).await {
            Ok(hash) => hash == source,
            Err(err) => {
                warn!(path = %candidate.dest.display(), error = %err, "cannot fingerprint destination");
                false
            }
        }
    }
}

fn candidate_for(
    request: &PlanRequest<'_>,
    source: PathBuf,
    relative: PathBuf,
) -> Result<Candidate, PlanError> {
    let dest = mirror_path_for(request.dest_root, &relative)?;
    Ok(Candidate {
        source,
        dest,
        relative,
    })
}

/// Source rows whose identity is missing on the destination. Keys are matched
/// as a multiset: `n` source rows against `k` destination rows yields `n - k`
/// copies. Rows outside the source root land in the fallback directory under
/// a name no other planned or existing destination file uses.
fn identity_candidates(
    request: &PlanRequest<'_>,
    source_rows: &[TrackRecord],
    dest_rows: &[TrackRecord],
) -> Result<Vec<Candidate>, PlanError> {
    let mut on_device: HashMap<TrackKey, usize> = HashMap::new();
    let mut device_paths: HashSet<PathBuf> = HashSet::new();
    for row in dest_rows {
        let path = Path::new(&row.path);
        if let Ok(rel) = relative_to(request.dest_root, path) {
            device_paths.insert(rel);
        }
        if let Some(key) = track_key(row) {
            *on_device.entry(key).or_default() += 1;
        }
    }

    // Mirrored paths are fixed by the source layout, so fallback names must
    // steer around them as well as around files already on the device.
    let mut taken: HashSet<PathBuf> = device_paths.clone();
    taken.extend(
        source_rows
            .iter()
            .filter_map(|row| relative_to(request.source_root, Path::new(&row.path)).ok()),
    );

    let mut out = Vec::new();
    for row in source_rows {
        let source = PathBuf::from(&row.path);
        if !request.extensions.admits(&source) {
            continue;
        }
        let (relative, fallback) = match relative_to(request.source_root, &source) {
            Ok(rel) => (rel, false),
            Err(_) => match source.file_name() {
                Some(name) => (Path::new(request.fallback_dir).join(name), true),
                None => continue,
            },
        };

        match track_key(row) {
            Some(key) => {
                if let Some(count) = on_device.get_mut(&key)
                    && *count > 0
                {
                    *count -= 1;
                    continue;
                }
            }
            None => {
                if device_paths.contains(&relative) {
                    continue;
                }
            }
        }

        let relative = if fallback {
            let unique = unclaimed_name(&relative, &taken);
            if unique != relative {
                info!(
                    source = %source.display(),
                    dest = %unique.display(),
                    "fallback name already in use, renaming"
                );
            }
            taken.insert(unique.clone());
            unique
        } else {
            relative
        };
        out.push(candidate_for(request, source, relative)?);
    }
    Ok(out)
}

/// `relative` itself when free, otherwise `stem (n).ext` for the first free `n`.
fn unclaimed_name(relative: &Path, taken: &HashSet<PathBuf>) -> PathBuf {
    if !taken.contains(relative) {
        return relative.to_path_buf();
    }
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));
    let stem = relative
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = relative
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 2u32;
    loop {
        let candidate = parent.join(format!("{stem} ({n}){ext}"));
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(path: &Path, artist: &str, album: &str, title: &str, duration: i64) -> TrackRecord {
        TrackRecord {
            path: path.to_string_lossy().into_owned(),
            artist: artist.into(),
            album: album.into(),
            title: title.into(),
            duration_seconds: duration,
            ..TrackRecord::default()
        }
    }

    fn planner() -> SyncPlanner {
        SyncPlanner::new(FingerprintCache::uncached(), FingerprintCache::uncached())
    }

    fn request<'a>(
        src: &'a Path,
        dst: &'a Path,
        selection: Selection,
        extensions: &'a ExtensionFilter,
        skip_existing: bool,
    ) -> PlanRequest<'a> {
        PlanRequest {
            source_root: src,
            dest_root: dst,
            selection,
            extensions,
            skip_existing,
            fallback_dir: "Unsorted",
        }
    }

    #[tokio::test]
    async fn full_plan_skips_identical_and_resumes_shorter() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("Album")).unwrap();
        std::fs::create_dir_all(dst.join("Album")).unwrap();
        std::fs::write(src.join("Album/01 Song.flac"), b"0123456789").unwrap();
        std::fs::write(src.join("Album/02 Same.flac"), b"same").unwrap();
        std::fs::write(src.join("Album/03 Part.flac"), b"abcdefgh").unwrap();
        std::fs::write(src.join("Album/notes.txt"), b"ignored").unwrap();
        std::fs::write(dst.join("Album/02 Same.flac"), b"same").unwrap();
        std::fs::write(dst.join("Album/03 Part.flac"), b"abc").unwrap();

        let ext = ExtensionFilter::new(["flac"]);
        let plan = planner()
            .plan(
                &request(&src, &dst, Selection::Whole, &ext, false),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(plan.identical, 1);
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].relative, PathBuf::from("Album/01 Song.flac"));
        assert_eq!(plan.entries[0].bytes_remaining, 10);
        assert_eq!(plan.entries[1].bytes_remaining, 5);
        assert_eq!(plan.total_bytes, 15);
        assert_eq!(plan.planned_relative.len(), 3);
        assert_eq!(plan.scope, PruneScope::Everything);
    }

    #[tokio::test]
    async fn skip_existing_assumes_same_size_destination_complete() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(src.join("a.mp3"), b"good").unwrap();
        std::fs::write(dst.join("a.mp3"), b"evil").unwrap();

        let ext = ExtensionFilter::new(["mp3"]);
        let cancel = CancellationToken::new();
        let skipping = planner()
            .plan(&request(&src, &dst, Selection::Whole, &ext, true), &cancel)
            .await
            .unwrap();
        assert_eq!(skipping.entries[0].bytes_remaining, 0);
        assert_eq!(skipping.total_bytes, 0);

        let rewriting = planner()
            .plan(&request(&src, &dst, Selection::Whole, &ext, false), &cancel)
            .await
            .unwrap();
        assert_eq!(rewriting.entries[0].bytes_remaining, 4);
    }

    #[tokio::test]
    async fn partial_plan_only_walks_selected_subtrees() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        for sub in ["A", "AB"] {
            std::fs::create_dir_all(src.join(sub)).unwrap();
            std::fs::write(src.join(sub).join("t.ogg"), sub).unwrap();
        }

        let ext = ExtensionFilter::new(["ogg"]);
        let plan = planner()
            .plan(
                &request(&src, &dst, Selection::Subtrees(vec![PathBuf::from("A")]), &ext, false),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].dest_path, dst.join("A/t.ogg"));
        assert_eq!(plan.scope, PruneScope::Subtrees(vec![PathBuf::from("A")]));
    }

    #[tokio::test]
    async fn add_missing_matches_identity_across_formats() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("Album")).unwrap();
        std::fs::write(src.join("Album/song.flac"), b"lossless").unwrap();
        std::fs::write(src.join("Album/other.flac"), b"other").unwrap();

        let source_rows = vec![
            row(&src.join("Album/song.flac"), "Artist", "Album", "Song", 200),
            row(&src.join("Album/other.flac"), "Artist", "Album", "Other", 100),
        ];
        let dest_rows = vec![row(
            &dst.join("Elsewhere/song.mp3"),
            " artist ",
            "ALBUM",
            "song",
            200,
        )];

        let ext = ExtensionFilter::new(["flac", "mp3"]);
        let plan = planner()
            .plan(
                &request(
                    &src,
                    &dst,
                    Selection::Identity {
                        source_rows,
                        dest_rows,
                    },
                    &ext,
                    false,
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].relative, PathBuf::from("Album/other.flac"));
        assert_eq!(plan.scope, PruneScope::Disabled);
    }

    #[test]
    fn identity_collisions_match_as_multiset_and_fall_back() {
        let src = PathBuf::from("/lib");
        let dst = PathBuf::from("/dev/Music");
        let ext = ExtensionFilter::default();
        let req = request(&src, &dst, Selection::Whole, &ext, false);

        let source_rows = vec![
            row(Path::new("/lib/a/1.flac"), "X", "Y", "Z", 10),
            row(Path::new("/lib/b/1.flac"), "X", "Y", "Z", 10),
            row(Path::new("/lib/untagged.flac"), "", "", "", 0),
            row(Path::new("/elsewhere/loose.flac"), "Q", "", "", 5),
        ];
        let dest_rows = vec![
            row(Path::new("/dev/Music/z.mp3"), "x", "y", "z", 10),
            row(Path::new("/dev/Music/untagged.flac"), "", "", "", 0),
        ];

        let found = identity_candidates(&req, &source_rows, &dest_rows).unwrap();
        let rels: Vec<PathBuf> = found.into_iter().map(|c| c.relative).collect();
        assert_eq!(
            rels,
            vec![PathBuf::from("b/1.flac"), PathBuf::from("Unsorted/loose.flac")]
        );
    }

    #[test]
    fn fallback_names_never_collide() {
        let src = PathBuf::from("/lib");
        let dst = PathBuf::from("/dev/Music");
        let ext = ExtensionFilter::default();
        let req = request(&src, &dst, Selection::Whole, &ext, false);

        let source_rows = vec![
            row(Path::new("/other_lib/x/01.flac"), "A", "One", "First", 60),
            row(Path::new("/other_lib/y/01.flac"), "B", "Two", "Second", 90),
            row(Path::new("/other_lib/z/02.flac"), "C", "Three", "Third", 30),
            row(Path::new("/lib/Unsorted/03.flac"), "D", "Four", "Fourth", 40),
            row(Path::new("/other_lib/w/03.flac"), "E", "Five", "Fifth", 50),
        ];
        // A different track already occupies Unsorted/02.flac on the device.
        let dest_rows = vec![row(
            Path::new("/dev/Music/Unsorted/02.flac"),
            "Z",
            "Elsewhere",
            "Unrelated",
            10,
        )];

        let found = identity_candidates(&req, &source_rows, &dest_rows).unwrap();
        let rels: Vec<PathBuf> = found.into_iter().map(|c| c.relative).collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("Unsorted/01.flac"),
                PathBuf::from("Unsorted/01 (2).flac"),
                PathBuf::from("Unsorted/02 (2).flac"),
                PathBuf::from("Unsorted/03.flac"),
                PathBuf::from("Unsorted/03 (2).flac"),
            ]
        );
    }

    #[test]
    fn unclaimed_name_counts_past_taken_suffixes() {
        let taken: HashSet<PathBuf> = ["Unsorted/a.mp3", "Unsorted/a (2).mp3"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(
            unclaimed_name(Path::new("Unsorted/a.mp3"), &taken),
            PathBuf::from("Unsorted/a (3).mp3")
        );
        assert_eq!(
            unclaimed_name(Path::new("Unsorted/b.mp3"), &taken),
            PathBuf::from("Unsorted/b.mp3")
        );
    }

    #[tokio::test]
    async fn cancelled_planning_stops() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ext = ExtensionFilter::default();
        let dst = dir.path().join("nowhere");
        let err = planner()
            .plan(&request(dir.path(), &dst, Selection::Whole, &ext, false), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Cancelled));
    }
}
