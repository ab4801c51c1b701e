use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
    #[error("{path} is not under {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// Maps a root-relative path under `root`, refusing anything that could
/// escape it.
pub fn mirror_path_for(root: &Path, relative: &Path) -> Result<PathBuf, PathError> {
    if relative.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn relative_to(root: &Path, path: &Path) -> Result<PathBuf, PathError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| PathError::OutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })
}

/// Drops selections nested inside another selection. Ancestry is
/// component-wise, so `Rock` never swallows `Rockabilly`.
pub fn top_level_selections(selections: &[PathBuf]) -> Vec<PathBuf> {
    let unique: BTreeSet<PathBuf> = selections.iter().map(|p| normalize(p)).collect();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(unique.len());
    for candidate in unique {
        if kept.iter().any(|parent| candidate.starts_with(parent)) {
            continue;
        }
        kept.push(candidate);
    }
    kept
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Case-insensitive allow-list of file extensions. An empty filter admits
/// every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    allowed: BTreeSet<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { allowed }
    }

    /// Parses a space- or comma-separated list such as `".mp3 .flac"`.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split(|c: char| c.is_whitespace() || c == ','))
    }

    pub fn admits(&self, path: &Path) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| self.allowed.contains(&ext.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or(false)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Files found by [`walk_tree`], plus the subdirectories that could not be
/// listed. A listing with unreadable directories is incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkListing {
    pub files: Vec<PathBuf>,
    pub unreadable_dirs: Vec<PathBuf>,
}

impl WalkListing {
    pub fn is_complete(&self) -> bool {
        self.unreadable_dirs.is_empty()
    }
}

/// Recursively lists files under `root` that pass `filter`, sorted.
/// Symlinks to files are listed; symlinked directories are not entered.
/// Hidden directories are skipped. Only an unreadable root is an error.
pub async fn walk_tree(root: &Path, filter: &ExtensionFilter) -> io::Result<WalkListing> {
    walk_with(root, filter, |dir: PathBuf| tokio::fs::read_dir(dir)).await
}

/// [`walk_tree`] without the unreadable-directory report.
pub async fn walk_files(root: &Path, filter: &ExtensionFilter) -> io::Result<Vec<PathBuf>> {
    Ok(walk_tree(root, filter).await?.files)
}

async fn walk_with<F, Fut>(root: &Path, filter: &ExtensionFilter, open: F) -> io::Result<WalkListing>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<tokio::fs::ReadDir>>,
{
    let mut listing = WalkListing::default();
    let mut pending = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        let mut entries = match open(dir.clone()).await {
            Ok(entries) => entries,
            Err(err) if first => return Err(err),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                listing.unreadable_dirs.push(dir);
                continue;
            }
        };
        first = false;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "directory listing interrupted");
                    listing.unreadable_dirs.push(dir.clone());
                    break;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping entry");
                    continue;
                }
            };
            if file_type.is_dir() {
                if !is_hidden(&path) {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                if filter.admits(&path) {
                    listing.files.push(path);
                }
            } else if file_type.is_symlink() {
                match tokio::fs::metadata(&path).await {
                    Ok(target) if target.is_file() => {
                        if filter.admits(&path) {
                            listing.files.push(path);
                        }
                    }
                    Ok(_) => debug!(path = %path.display(), "not following directory symlink"),
                    Err(err) => debug!(path = %path.display(), error = %err, "dangling symlink"),
                }
            }
        }
    }

    listing.files.sort();
    listing.unreadable_dirs.sort();
    Ok(listing)
}
