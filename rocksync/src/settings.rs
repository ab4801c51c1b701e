use std::env;
use std::path::{Path, PathBuf};

use rocksync_core::config::{DEFAULT_SYNC_EXTENSIONS, SyncConfig, SyncMode, TransformParams};
use rocksync_core::device::{ConfiguredDevices, DeviceInfo};
use rocksync_core::sync::hash::HASH_CHUNK_BYTES;
use rocksync_core::sync::index::library_db_path;
use rocksync_core::sync::paths::ExtensionFilter;
use serde::Serialize;

const DEFAULT_MUSIC_DIR_NAME: &str = "Music";

/// Everything the CLI reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub music_root: PathBuf,
    pub library_index: PathBuf,
    pub device_mounts: Vec<PathBuf>,
    pub dummy_device: Option<PathBuf>,
    pub extensions: ExtensionFilter,
    pub skip_existing: bool,
    pub delete_extras: bool,
    pub prune_to_trash: bool,
    pub verify: bool,
    pub auto_repair: bool,
    pub chunk_bytes: u64,
    pub transform_cmd: Option<String>,
    pub transform: TransformParams,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub music_root: String,
    pub library_index: String,
    pub device_mounts: Vec<String>,
    pub dummy_device: Option<String>,
    pub extensions: Vec<String>,
    pub skip_existing: bool,
    pub delete_extras: bool,
    pub prune_to_trash: bool,
    pub verify: bool,
    pub auto_repair: bool,
    pub chunk_bytes: u64,
    pub transform_cmd: Option<String>,
    pub target_bits: u16,
    pub target_rate: u32,
    pub cover_max: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(env::temp_dir);
        let music_root = read_path_env("ROCKSYNC_MUSIC_ROOT", &home)
            .or_else(dirs::audio_dir)
            .unwrap_or_else(|| home.join(DEFAULT_MUSIC_DIR_NAME));
        let library_index = read_path_env("ROCKSYNC_LIBRARY_INDEX", &home)
            .or_else(|| library_db_path().ok())
            .unwrap_or_else(|| env::temp_dir().join("rocksync/music_index.sqlite3"));
        let device_mounts = env::var_os("ROCKSYNC_DEVICE_MOUNTS")
            .map(|value| {
                env::split_paths(&value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| expand_with_home(&p.to_string_lossy(), &home))
                    .collect()
            })
            .unwrap_or_default();
        let extensions = env::var("ROCKSYNC_EXTENSIONS")
            .ok()
            .map(|value| ExtensionFilter::parse(&value))
            .filter(|filter| filter.extensions().next().is_some())
            .unwrap_or_else(|| ExtensionFilter::new(DEFAULT_SYNC_EXTENSIONS));
        let defaults = TransformParams::default();

        Self {
            music_root,
            library_index,
            device_mounts,
            dummy_device: read_path_env("ROCKSYNC_DUMMY_DEVICE", &home),
            extensions,
            skip_existing: read_bool_env("ROCKSYNC_SKIP_EXISTING", false),
            delete_extras: read_bool_env("ROCKSYNC_DELETE_EXTRAS", false),
            prune_to_trash: read_bool_env("ROCKSYNC_PRUNE_TO_TRASH", false),
            verify: read_bool_env("ROCKSYNC_VERIFY", true),
            auto_repair: read_bool_env("ROCKSYNC_AUTO_REPAIR", true),
            chunk_bytes: read_u64_env("ROCKSYNC_CHUNK_BYTES", HASH_CHUNK_BYTES as u64),
            transform_cmd: env::var("ROCKSYNC_TRANSFORM_CMD")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            transform: TransformParams {
                bit_depth: read_u64_env("ROCKSYNC_TARGET_BITS", defaults.bit_depth.into())
                    .try_into()
                    .unwrap_or(defaults.bit_depth),
                sample_rate: read_u64_env("ROCKSYNC_TARGET_RATE", defaults.sample_rate.into())
                    .try_into()
                    .unwrap_or(defaults.sample_rate),
                cover_max_px: read_u64_env("ROCKSYNC_COVER_MAX", defaults.cover_max_px.into())
                    .try_into()
                    .unwrap_or(defaults.cover_max_px),
            },
        }
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            music_root: self.music_root.display().to_string(),
            library_index: self.library_index.display().to_string(),
            device_mounts: self
                .device_mounts
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            dummy_device: self.dummy_device.as_ref().map(|p| p.display().to_string()),
            extensions: self.extensions.extensions().map(str::to_string).collect(),
            skip_existing: self.skip_existing,
            delete_extras: self.delete_extras,
            prune_to_trash: self.prune_to_trash,
            verify: self.verify,
            auto_repair: self.auto_repair,
            chunk_bytes: self.chunk_bytes,
            transform_cmd: self.transform_cmd.clone(),
            target_bits: self.transform.bit_depth,
            target_rate: self.transform.sample_rate,
            cover_max: self.transform.cover_max_px,
        }
    }

    pub fn locator(&self) -> ConfiguredDevices {
        ConfiguredDevices {
            mounts: self.device_mounts.clone(),
            dummy: self.dummy_device.clone(),
        }
    }

    pub fn sync_config(&self, device: &DeviceInfo, mode: SyncMode) -> SyncConfig {
        let mut config = SyncConfig::new(&self.music_root, device.music_root(), mode);
        config.extensions = self.extensions.clone();
        config.skip_existing = self.skip_existing;
        config.delete_extras = self.delete_extras;
        config.prune_to_trash = self.prune_to_trash;
        config.verify = self.verify;
        config.auto_repair = self.auto_repair;
        config.chunk_bytes = usize::try_from(self.chunk_bytes).unwrap_or(HASH_CHUNK_BYTES);
        config.transform = self.transform_cmd.as_ref().map(|_| self.transform);
        config.library_index = Some(self.library_index.clone());
        config.device_index = Some(device.index_path());
        config
    }
}

fn read_path_env(name: &str, home: &Path) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| expand_with_home(&value, home))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
