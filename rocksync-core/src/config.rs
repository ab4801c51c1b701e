use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::sync::hash::HASH_CHUNK_BYTES;
use crate::sync::index::{device_db_path_for_root, library_db_path};
use crate::sync::paths::{ExtensionFilter, top_level_selections};

pub const DEFAULT_SYNC_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "ogg", "opus"];
pub const DEFAULT_FALLBACK_DIR: &str = "Unsorted";
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("source root {0} is not a directory")]
    SourceNotDirectory(PathBuf),
    #[error("destination root {0} exists and is not a directory")]
    DestinationNotDirectory(PathBuf),
    #[error("source {} and destination {} overlap", source_root.display(), dest_root.display())]
    OverlappingRoots { source_root: PathBuf, dest_root: PathBuf },
    #[error("partial sync needs at least one selected folder")]
    EmptySelection,
    #[error("selection {0} is not inside the source root")]
    SelectionOutsideSource(PathBuf),
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    /// Selected subtrees, absolute or relative to the source root.
    Partial(Vec<PathBuf>),
    AddMissing,
}

impl SyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Partial(_) => "partial",
            SyncMode::AddMissing => "add-missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub bit_depth: u16,
    pub sample_rate: u32,
    pub cover_max_px: u32,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            bit_depth: 16,
            sample_rate: 44_100,
            cover_max_px: 500,
        }
    }
}

/// Everything one sync run needs. Built by the caller and handed to the
/// engine; the engine keeps no other settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub mode: SyncMode,
    pub extensions: ExtensionFilter,
    pub skip_existing: bool,
    pub delete_extras: bool,
    pub prune_to_trash: bool,
    pub verify: bool,
    pub auto_repair: bool,
    pub verify_only: bool,
    pub scan_first: bool,
    /// `None` disables the transform phase.
    pub transform: Option<TransformParams>,
    pub fallback_dir: String,
    pub chunk_bytes: usize,
    pub progress_interval: Duration,
    /// `None` runs without a library index.
    pub library_index: Option<PathBuf>,
    /// `None` runs without a device index.
    pub device_index: Option<PathBuf>,
}

impl SyncConfig {
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>, mode: SyncMode) -> Self {
        let dest_root = dest_root.into();
        Self {
            source_root: source_root.into(),
            device_index: Some(device_db_path_for_root(&dest_root)),
            dest_root,
            mode,
            extensions: ExtensionFilter::new(DEFAULT_SYNC_EXTENSIONS),
            skip_existing: false,
            delete_extras: false,
            prune_to_trash: false,
            verify: true,
            auto_repair: true,
            verify_only: false,
            scan_first: true,
            transform: None,
            fallback_dir: DEFAULT_FALLBACK_DIR.to_string(),
            chunk_bytes: HASH_CHUNK_BYTES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            library_index: library_db_path().ok(),
        }
    }

    /// Checks roots and selections without touching anything but metadata.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.source_root.is_dir() {
            return Err(ConfigError::SourceNotDirectory(self.source_root.clone()));
        }
        if self.dest_root.as_os_str().is_empty()
            || (self.dest_root.exists() && !self.dest_root.is_dir())
        {
            return Err(ConfigError::DestinationNotDirectory(self.dest_root.clone()));
        }

        let source = canonical_or_self(&self.source_root);
        let dest = canonical_or_self(&self.dest_root);
        if source.starts_with(&dest) || dest.starts_with(&source) {
            return Err(ConfigError::OverlappingRoots {
                source_root: self.source_root.clone(),
                dest_root: self.dest_root.clone(),
            });
        }

        if self.chunk_bytes == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }

        if let SyncMode::Partial(_) = &self.mode {
            self.resolved_selections()?;
        }
        Ok(())
    }

    /// Partial selections as top-level paths relative to the source root.
    /// Other modes select the whole root, returned as an empty list.
    pub fn resolved_selections(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let SyncMode::Partial(selected) = &self.mode else {
            return Ok(Vec::new());
        };

        let mut relative = Vec::with_capacity(selected.len());
        for path in selected {
            let rel = if path.is_absolute() {
                path.strip_prefix(&self.source_root)
                    .map(Path::to_path_buf)
                    .map_err(|_| ConfigError::SelectionOutsideSource(path.clone()))?
            } else {
                path.clone()
            };
            if rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(ConfigError::SelectionOutsideSource(path.clone()));
            }
            relative.push(rel);
        }

        let kept: Vec<PathBuf> = top_level_selections(&relative)
            .into_iter()
            .filter(|rel| !rel.as_os_str().is_empty())
            .collect();
        if kept.is_empty() {
            return Err(ConfigError::EmptySelection);
        }
        Ok(kept)
    }
}

// The destination may not exist yet; resolve through its parent then.
fn canonical_or_self(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => canonical_or_self(parent).join(name),
        _ => path.to_path_buf(),
    }
}
